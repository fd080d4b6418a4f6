use std::any::Any;
use std::time::Duration;

use indicatif::ProgressStyle;

use crate::error::RuntimeError;

/// Installs the global subscriber: `RUST_LOG` filtering, formatted output
/// routed through the progress bars. Does nothing when a subscriber is
/// already installed.
#[cfg(feature = "logging")]
pub(crate) fn init_logging() -> Result<(), RuntimeError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();

    if let Err(err) = installed {
        tracing::debug!("Keeping the existing subscriber: {err}");
    }

    Ok(())
}

#[cfg(not(feature = "logging"))]
pub(crate) fn init_logging() -> Result<(), RuntimeError> {
    Ok(())
}

/// Spinner shown for every running task.
pub(crate) fn get_style_task() -> Result<ProgressStyle, RuntimeError> {
    Ok(ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")?
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "))
}

/// Progress bar of a top-level join scope.
pub(crate) fn get_style_scope() -> Result<ProgressStyle, RuntimeError> {
    Ok(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?
    .progress_chars("=>-"))
}

/// Human readable message out of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// The line printed when a top-level join scope closes. Its last token is
/// the elapsed time in seconds.
pub(crate) fn timing_line(elapsed: Duration) -> String {
    format!("Time elapsed: {:.6}", elapsed.as_secs_f64())
}
