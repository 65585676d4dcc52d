//! Layered configuration: compiled-in defaults, then `<workspace>/kiln.toml`,
//! then CLI flags (§4.10). Each layer only overrides fields it actually sets.

use std::time::Duration;

use color_eyre::eyre::Context;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{command::fingerprint::ENV_WHITELIST, error::Error, journal, workspace::Workspace};

/// The fully-resolved configuration an executor is built from.
#[derive(Clone, Debug)]
pub struct Config {
    pub worker_count: usize,
    pub ready_queue_bound: usize,
    pub journal_queue_bound: usize,
    pub journal_batch_size: usize,
    pub journal_flush_interval: Duration,
    pub compaction_growth_factor: usize,
    pub default_command_timeout: Option<Duration>,
    pub env_whitelist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            ready_queue_bound: 1024,
            journal_queue_bound: 1024,
            journal_batch_size: 64,
            journal_flush_interval: Duration::from_millis(50),
            compaction_growth_factor: journal::COMPACTION_GROWTH_FACTOR,
            default_command_timeout: None,
            env_whitelist: ENV_WHITELIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The shape of `kiln.toml`: every field optional, so a partial file only
/// overrides what it names.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub worker_count: Option<usize>,
    pub ready_queue_bound: Option<usize>,
    pub journal_queue_bound: Option<usize>,
    pub journal_batch_size: Option<usize>,
    pub journal_flush_interval_ms: Option<u64>,
    pub compaction_growth_factor: Option<usize>,
    pub default_command_timeout_secs: Option<u64>,
    pub env_whitelist: Option<Vec<String>>,
}

/// CLI-flag overrides, the final and highest-priority layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub worker_count: Option<usize>,
    pub default_command_timeout: Option<Duration>,
}

impl Config {
    fn apply_file(mut self, file: FileConfig) -> Self {
        if let Some(v) = file.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = file.ready_queue_bound {
            self.ready_queue_bound = v;
        }
        if let Some(v) = file.journal_queue_bound {
            self.journal_queue_bound = v;
        }
        if let Some(v) = file.journal_batch_size {
            self.journal_batch_size = v;
        }
        if let Some(v) = file.journal_flush_interval_ms {
            self.journal_flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.compaction_growth_factor {
            self.compaction_growth_factor = v;
        }
        if let Some(v) = file.default_command_timeout_secs {
            self.default_command_timeout = Some(Duration::from_secs(v));
        }
        if let Some(v) = file.env_whitelist {
            self.env_whitelist = v;
        }
        self
    }

    fn apply_cli(mut self, cli: CliOverrides) -> Self {
        if let Some(v) = cli.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = cli.default_command_timeout {
            self.default_command_timeout = Some(v);
        }
        self
    }

    /// Load the layered configuration for `workspace`: defaults, then
    /// `kiln.toml` if present, then `cli`. A malformed `kiln.toml` is a
    /// fatal [`Error::Config`] — the build never starts (§7).
    #[instrument(skip(cli))]
    pub async fn load(workspace: &Workspace, cli: CliOverrides) -> Result<Self, Error> {
        let config_path = workspace.config_path();
        let file_config = match crate::fs::read_buffered_utf8(
            &crate::path::AbsFilePath::try_from(config_path.clone())
                .map_err(|e| Error::Config(e.to_string()))?,
        )
        .await
        .map_err(|e| Error::Config(e.to_string()))?
        {
            Some(contents) => toml::from_str::<FileConfig>(&contents)
                .with_context(|| format!("parse {config_path:?}"))
                .map_err(|e| Error::Config(e.to_string()))?,
            None => FileConfig::default(),
        };

        Ok(Self::default().apply_file(file_config).apply_cli(cli))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::path::AbsDirPath;

    #[tokio::test]
    async fn missing_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        let config = Config::load(&ws, CliOverrides::default()).await.unwrap();
        assert_eq!(config.worker_count, num_cpus::get().max(1));
    }

    #[tokio::test]
    async fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        tokio::fs::write(ws.config_path(), "worker_count = 3\ndefault_command_timeout_secs = 30\n")
            .await
            .unwrap();
        let config = Config::load(&ws, CliOverrides::default()).await.unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.default_command_timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn cli_overrides_win_over_file() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        tokio::fs::write(ws.config_path(), "worker_count = 3\n").await.unwrap();
        let cli = CliOverrides { worker_count: Some(8), default_command_timeout: None };
        let config = Config::load(&ws, cli).await.unwrap();
        assert_eq!(config.worker_count, 8);
    }

    #[tokio::test]
    async fn malformed_config_is_fatal() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        tokio::fs::write(ws.config_path(), "worker_count = \"not a number\"\n")
            .await
            .unwrap();
        let err = Config::load(&ws, CliOverrides::default()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unknown_field_is_rejected() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        tokio::fs::write(ws.config_path(), "not_a_real_field = 1\n").await.unwrap();
        let err = Config::load(&ws, CliOverrides::default()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
