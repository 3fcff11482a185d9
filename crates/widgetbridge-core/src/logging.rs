use crate::config::LoggingConfig;
use crate::error::{CoreError, CoreResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber described by `cfg`.
///
/// `RUST_LOG` wins over `cfg.filter`. When a log file is configured the
/// returned guard must be kept alive for buffered lines to be flushed.
pub fn init_logging_with(cfg: &LoggingConfig) -> CoreResult<Option<WorkerGuard>> {
    let fallback = cfg.filter.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|e| CoreError::Logging(format!("invalid filter {fallback:?}: {e}")))?;

    let Some(path) = cfg.file.as_ref() else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_ansi(cfg.ansi.unwrap_or(true))
            .try_init();
        return Ok(None);
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let _ = fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .try_init();

    tracing::info!("logging initialized: {}", path.display());
    Ok(Some(guard))
}
