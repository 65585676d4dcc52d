//! The workspace: resolves the `.cache` layout a build runs against (§4.10).
//!
//! Everything the executor needs to persist lives under one root directory's
//! `.cache` subdirectory. `Workspace` is the single place that knows the
//! three file names; callers ask it for paths rather than hardcoding them.

use color_eyre::{Result, eyre::Context};
use tracing::instrument;

use crate::{
    fs,
    path::{AbsDirPath, TryJoinWith},
};

const CACHE_DIR: &str = ".cache";
const FILE_JOURNAL: &str = "files.journal";
const COMMAND_JOURNAL: &str = "commands.journal";
const INPUT_DB: &str = "inputs.db";
const CONFIG_FILE: &str = "kiln.toml";

/// The on-disk layout rooted at a workspace directory.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: AbsDirPath,
    cache_dir: AbsDirPath,
}

impl Workspace {
    /// Resolve a workspace rooted at `root`, creating `.cache` if it doesn't
    /// exist yet.
    #[instrument]
    pub async fn open(root: AbsDirPath) -> Result<Self> {
        let cache_dir = root.try_join_dir(CACHE_DIR).context("resolve cache dir")?;
        fs::create_dir_all(&cache_dir)
            .await
            .context("create .cache directory")?;
        Ok(Self { root, cache_dir })
    }

    pub fn root(&self) -> &AbsDirPath {
        &self.root
    }

    pub fn cache_dir(&self) -> &AbsDirPath {
        &self.cache_dir
    }

    pub fn file_journal_path(&self) -> std::path::PathBuf {
        self.cache_dir.as_std_path().join(FILE_JOURNAL)
    }

    pub fn command_journal_path(&self) -> std::path::PathBuf {
        self.cache_dir.as_std_path().join(COMMAND_JOURNAL)
    }

    pub fn input_db_path(&self) -> std::path::PathBuf {
        self.cache_dir.as_std_path().join(INPUT_DB)
    }

    /// `<root>/kiln.toml`, whether or not it exists — config loading decides
    /// what a missing file means.
    pub fn config_path(&self) -> std::path::PathBuf {
        self.root.as_std_path().join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn open_creates_cache_dir() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let ws = Workspace::open(root).await.unwrap();
        assert!(ws.cache_dir().as_std_path().is_dir());
        assert_eq!(ws.file_journal_path().file_name().unwrap(), FILE_JOURNAL);
        assert_eq!(ws.command_journal_path().file_name().unwrap(), COMMAND_JOURNAL);
        assert_eq!(ws.input_db_path().file_name().unwrap(), INPUT_DB);
    }

    #[tokio::test]
    async fn open_is_idempotent_on_existing_cache_dir() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        Workspace::open(root.clone()).await.unwrap();
        let ws = Workspace::open(root).await.unwrap();
        assert!(ws.cache_dir().as_std_path().is_dir());
    }

    #[tokio::test]
    async fn config_path_is_under_root_not_cache() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let ws = Workspace::open(root).await.unwrap();
        assert_eq!(ws.config_path(), dir.path().join(CONFIG_FILE));
    }
}
