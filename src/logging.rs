use std::path::Path;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing logging system.
///
/// - Stderr: `warn` and above by default, `debug` with `verbose`.
/// - File: when `process_name` is set (daemon and worker processes),
///   `debug` and above is also written to `<root>/logs/<name>.log`.
///
/// Stdout is never used: the worker's stdout carries the `worker_ready`
/// handshake frame and CLI subcommands print their JSON results there.
pub fn init(root: &Path, process_name: Option<&str>, verbose: bool) {
    let stderr_filter = if verbose { "debug" } else { "warn" };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(stderr_filter));

    if let Some(name) = process_name {
        let log_dir = root.join("logs");
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender =
                tracing_appender::rolling::never(&log_dir, format!("{name}.log"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(
                    fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_filter(EnvFilter::new("debug")),
                )
                .init();
            tracing::debug!("logging initialized (file: {})", log_dir.join(name).display());
            return;
        }
    }

    tracing_subscriber::registry().with(stderr_layer).init();
}
