use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for the CLI (optional rolling file + stderr console).
///
/// Console output goes to stderr: stdout is reserved for JSON results.
pub fn init_service_logging(
    log_dir: Option<&Path>,
    service_name: &str,
) -> Result<(), anyhow::Error> {
    // Set up environment filter (can be controlled via RUST_LOG env var)
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writable_dir = log_dir.filter(|dir| {
        std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::File::create(dir.join(".test_write")))
            .map(|_| std::fs::remove_file(dir.join(".test_write")))
            .is_ok()
    });

    if let Some(dir) = writable_dir {
        use tracing_appender::rolling;

        let _ = rotate_logs_on_startup(dir, service_name);

        let file_appender = rolling::daily(dir, format!("{service_name}.log"));
        let (non_blocking_file, guard_file) = non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let (non_blocking_stderr, guard_stderr) = non_blocking(std::io::stderr());
        let console_layer = fmt::layer()
            .with_writer(non_blocking_stderr)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        // Keep the writers alive for the entire program duration
        std::mem::forget(guard_file);
        std::mem::forget(guard_stderr);

        info!(
            "Logging initialized - logs will be written to {}/{service_name}.log",
            dir.display()
        );
    } else {
        let (non_blocking_stderr, guard_stderr) = non_blocking(std::io::stderr());
        let console_layer = fmt::layer()
            .with_writer(non_blocking_stderr)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;

        std::mem::forget(guard_stderr);
    }

    Ok(())
}

pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> Result<(), anyhow::Error> {
    let log_path = log_dir.join(format!("{service_name}.log"));

    if log_path.exists() {
        // Create backup with timestamp
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = log_dir.join(format!("{service_name}.{timestamp}.log"));

        std::fs::rename(&log_path, &backup_path)?;
        info!("Previous log file backed up to: {}", backup_path.display());
    }

    Ok(())
}
