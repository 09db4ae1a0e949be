//! Error kinds shared by every preparation stage.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while preparing disturbance layers.
///
/// Data-shape errors abort the current run. `Cleanup` is only surfaced by an
/// explicit [`crate::workspace::ScratchWorkspace::close`]; the drop path logs
/// it instead so it never masks the error that caused the unwind.
#[derive(Debug, Error)]
pub enum PrepError {
    /// Malformed field spec, unknown category, missing harvest layer, ...
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A mandatory input (grid, harvest, any source layer at all) is empty or absent.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Output would replace its own input.
    #[error("cannot overwrite {0}: specify a new workspace or a new layer name")]
    OverwriteGuard(String),

    /// A scratch workspace could not be removed.
    #[error("failed to delete scratch workspace {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace {path} cannot be opened: {reason}")]
    WorkspaceUnavailable { path: PathBuf, reason: String },

    #[error("layer '{name}' not found in {workspace}")]
    LayerNotFound { workspace: PathBuf, name: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PrepError>;

impl PrepError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json { path: path.into(), source }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
