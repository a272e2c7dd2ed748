use sockrelay_model::Severity;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// The most verbose level a [`crate::log::TracingSink`] emits for records at
/// or above `severity`.
pub fn level_for(severity: Severity) -> LevelFilter {
    match severity {
        Severity::Verbose => LevelFilter::TRACE,
        Severity::Trace => LevelFilter::DEBUG,
        Severity::Information => LevelFilter::INFO,
        Severity::Warning => LevelFilter::WARN,
        Severity::Error | Severity::Critical => LevelFilter::ERROR,
    }
}

/// `RUST_LOG` takes precedence over the level derived from `min_severity`.
pub fn init_tracing_subscriber(min_severity: Severity) {
    #[cfg(not(feature = "tokio-console"))]
    let console_layer = tracing_subscriber::layer::Identity::new();

    #[cfg(feature = "tokio-console")]
    let console_layer = console_subscriber::ConsoleLayer::builder()
        .with_default_env()
        .spawn();

    let filter = EnvFilter::builder()
        .with_default_directive(level_for(min_severity).into())
        .from_env_lossy();

    tracing_subscriber::Registry::default()
        .with(ErrorLayer::default())
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(console_layer)
        .init();
}
