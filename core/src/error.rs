use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PhoenixErr>;

/// Error taxonomy for the engine. Tool handlers translate these into
/// `ToolResult { status: error }` at the registry boundary; only the
/// reasoning loop and the bridge ever see them directly.
#[derive(Error, Debug)]
pub enum PhoenixErr {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A user-supplied path resolved outside the sandbox root.
    #[error("path escapes the sandbox: {0}")]
    PathEscape(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    PatchNotApplicable(#[from] phoenix_apply_patch::PatchError),

    #[error("parse error: {0}")]
    Parse(String),

    /// The model host could not be reached at all; this is the one error
    /// that terminates a reasoning loop instead of becoming an observation.
    #[error("model host unavailable: {0}")]
    ModelHostUnavailable(String),

    #[error("model call timed out")]
    ModelHostTimeout,

    #[error("vector store error: {0}")]
    Store(String),

    /// A second task or an incompatible session operation arrived while a
    /// loop was already running.
    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unknown(String),
}

impl From<rusqlite::Error> for PhoenixErr {
    fn from(err: rusqlite::Error) -> Self {
        PhoenixErr::Store(err.to_string())
    }
}

impl PhoenixErr {
    /// Whether the reasoning loop should keep going after reporting this
    /// error to the model as an observation.
    pub fn is_recoverable_in_loop(&self) -> bool {
        !matches!(self, PhoenixErr::ModelHostUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn only_host_unavailability_terminates_the_loop() {
        assert!(!PhoenixErr::ModelHostUnavailable("down".into()).is_recoverable_in_loop());
        assert!(PhoenixErr::ModelHostTimeout.is_recoverable_in_loop());
        assert!(PhoenixErr::InvalidArgument("x".into()).is_recoverable_in_loop());
        assert!(PhoenixErr::PathEscape(PathBuf::from("/etc")).is_recoverable_in_loop());
    }
}
