use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy shared by the runner, the ingester and the comparator.
///
/// Record-level conditions (duplicate model, unknown model, malformed
/// result) are recovered locally by the caller: skip the item, log, keep
/// going. Only pre-flight configuration errors and run-start collisions
/// abort the enclosing operation.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("unable to determine tool identity for {tool}: {reason}")]
    Configuration { tool: PathBuf, reason: String },

    #[error("run started at {0} already exists")]
    DuplicateRun(DateTime<Utc>),

    #[error("model {name} with format {format} already exists")]
    DuplicateModel { name: String, format: String },

    #[error("model {0} is not in the database")]
    UnknownModel(String),

    #[error("run {0} not found")]
    UnknownRun(i64),

    #[error("cannot parse {0}")]
    MalformedResult(PathBuf),
}
