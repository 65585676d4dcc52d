use clap::ValueEnum;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

/// Build the subscriber the binary installs as the global default.
///
/// `verbosity` raises the default filter level when `KILN_LOG` is unset: `0`
/// is `info`, each additional `-v` steps down to `debug` then `trace`.
pub fn make_logger<W>(writer: W, color: WhenColor, verbosity: u8) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(writer);
    let layer = match color {
        WhenColor::Always => layer.with_ansi(true),
        WhenColor::Never => layer.with_ansi(false),
        WhenColor::Auto => layer,
    }
    .with_filter(
        tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_directive.parse().expect("valid directive"))
            .with_env_var("KILN_LOG")
            .from_env_lossy(),
    );

    Ok(tracing_subscriber::registry().with(ErrorLayer::default()).with(layer))
}
