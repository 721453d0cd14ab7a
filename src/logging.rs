use color_eyre::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Send logs to a file in the data directory; stdout belongs to the session.
///
/// Keep the returned guard alive for the life of the process so buffered
/// lines are flushed.
pub fn init() -> Result<WorkerGuard> {
  let dir = crate::db::data_dir()?;
  std::fs::create_dir_all(&dir)?;

  let appender = tracing_appender::rolling::never(&dir, "clozeshell.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clozeshell=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
