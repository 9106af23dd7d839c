use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub(crate) const LOG_FILE_NAME: &str = "chatsync.log";

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once per process: `{data_dir}/chatsync.log`, plus
/// stderr when `RUST_LOG` is set. Later calls are no-ops.
pub(crate) fn init_logging(data_dir: &Path) {
    INIT.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        let file_layer = std::fs::create_dir_all(data_dir)
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(data_dir.join(LOG_FILE_NAME))
            })
            .map(|file| {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter())
            })
            .map_err(|e| eprintln!("chatsync: log file unavailable: {e}"))
            .ok();

        let stderr_layer = std::env::var_os("RUST_LOG").map(|_| {
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter())
        });

        // A host (or test harness) may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .try_init();
    });
}
