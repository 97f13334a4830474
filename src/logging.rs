use std::{path::PathBuf, sync::Mutex};

use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{prelude::*, EnvFilter};

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::ERROR
    };

    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

fn do_init(verbose: bool, log_dir: Option<PathBuf>) {
    let mut message = String::from("Logging with: stdout");

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(filter(verbose));

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some(output_dir) = log_dir {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "serial-mux.log");

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_filter(filter(verbose));
        Some(file_layer)
    } else {
        None
    };

    // Another subscriber may already be set, e.g. by a test harness.
    let _ = registry.with(maybe_file_layer).try_init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
/// `RUST_LOG` takes precedence over `verbose` when set.
pub fn init(verbose: bool, log_dir: Option<PathBuf>) {
    static TRACING_IS_INITIALIZED: Mutex<bool> = Mutex::new(false);

    let mut initialized = match TRACING_IS_INITIALIZED.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if !*initialized {
        do_init(verbose, log_dir);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Mark the end of the log before exit.
/// Writers are unbuffered, so there is nothing to flush.
pub fn shutdown() {
    trace!("Shutting down");
}
