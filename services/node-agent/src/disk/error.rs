//! Disk layout errors.

use thiserror::Error;

use super::resolver::ResolveError;
use crate::state::StateError;
use crate::system::CmdError;

/// Errors from disk layout operations.
///
/// Every variant carries the stage that failed; the underlying cause is kept
/// as the error source.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{stage}: {source:#}")]
    Partition {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage}: {source:#}")]
    Format {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("The filesystem type \"{0}\" is not supported")]
    UnsupportedFilesystem(String),

    #[error("{stage}: {source:#}")]
    Mount {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage}: {source:#}")]
    Unmount {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage}: {source}")]
    Command {
        stage: String,
        #[source]
        source: CmdError,
    },

    #[error("Insufficient remaining disk space ({available}B) for ephemeral partition (min: {minimum}B)")]
    InsufficientSpace { available: u64, minimum: u64 },

    #[error("cannot use root partition as ephemeral disk")]
    RootAsEphemeral,

    #[error("Unknown partitioner '{0}'")]
    UnknownPartitioner(String),

    #[error("{stage}: {source}")]
    State {
        stage: String,
        #[source]
        source: StateError,
    },

    #[error("{stage}: {source:#}")]
    Io {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DiskError {
    pub(crate) fn partition(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Partition {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn format(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Format {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn mount(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Mount {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn unmount(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Unmount {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn command(stage: impl Into<String>, source: CmdError) -> Self {
        Self::Command {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn io(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Io {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Whether this error means the disk could not be found in time.
    pub fn is_resolve_timeout(&self) -> bool {
        matches!(self, Self::Resolve(ResolveError::TimedOut { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_prefix_keeps_cause() {
        let err = DiskError::partition(
            "Partitioning ephemeral disk '/dev/xvdb'",
            anyhow::anyhow!("fake-partition-error"),
        );
        assert_eq!(
            err.to_string(),
            "Partitioning ephemeral disk '/dev/xvdb': fake-partition-error"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_unsupported_filesystem_message() {
        let err = DiskError::UnsupportedFilesystem("blahblah".to_string());
        assert_eq!(
            err.to_string(),
            "The filesystem type \"blahblah\" is not supported"
        );
    }

    #[test]
    fn test_insufficient_space_message() {
        let err = DiskError::InsufficientSpace {
            available: 10,
            minimum: 1024,
        };
        assert!(err.to_string().contains("Insufficient remaining disk"));
    }
}
