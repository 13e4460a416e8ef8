use thiserror::Error;

/// Errors that stop a run before it produces a [`crate::RunResult`].
///
/// Failures inside a scenario iteration never show up here: they are recorded as
/// failed samples. Threshold failures are not errors either, they are part of the
/// report.
#[derive(Debug, Error)]
pub enum Error {
    /// An option is missing or out of range. Raised before any virtual user starts.
    #[error("invalid option `{field}`: {reason}")]
    Config { field: String, reason: String },

    /// A threshold expression could not be parsed.
    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    Threshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// The requested concurrency could not be spawned.
    #[error("cannot spawn virtual users: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
