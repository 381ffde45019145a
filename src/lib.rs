//! Fuel station daily closing engine.
//!
//! Reconciles what the pumps metered against what the attendants declared
//! for one location, date and shift, and writes the closing through a
//! pluggable store (local SQLite, PostgREST, or in-memory).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod attendants;
pub mod closing;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod draft;
pub mod error;
pub mod meter;
pub mod payments;
pub mod quantity;
pub mod reconciliation;
pub mod store;
pub mod workspace;

pub use closing::{
    ClosingSubmitter, SubmissionReceipt, SubmissionRequest, SubmissionStatus, SubmissionStep,
};
pub use config::ClosingConfig;
pub use error::{StoreError, SubmissionError, ValidationError};
pub use workspace::ClosingWorkspace;

/// Initialize structured logging: console (stderr) plus a daily rolling file
/// in `log_dir`.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the life of the process.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fuel_closing_lib=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
