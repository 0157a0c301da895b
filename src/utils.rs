use std::any::Any;

use indicatif::ProgressStyle;

use crate::error::ImportError;

/// Progress bar attached to the span of every running session.
pub(crate) fn style_session() -> Result<ProgressStyle, ImportError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Installs a `tracing` subscriber printing events to stderr, with progress
/// bars for running sessions. Filtered by `RUST_LOG`, `info` by default.
///
/// Only the first call installs anything, it fails if some other global
/// subscriber was installed before.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), ImportError> {
    use std::sync::Once;

    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    static INIT: Once = Once::new();
    let mut result = Ok(());

    INIT.call_once(|| {
        let indicatif = IndicatifLayer::new();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        result = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
            .with(indicatif)
            .try_init()
            .map_err(ImportError::from);
    });

    result
}
