//! Process supervisor errors.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::system::CmdError;

/// Errors talking to monit.
#[derive(Debug, Error)]
pub enum MonitError {
    #[error("Sending request to monit: {0}")]
    Http(#[from] reqwest::Error),

    #[error("monit responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Parsing monit status: {0}")]
    Parse(#[from] quick_xml::DeError),

    #[error("Reading monit credentials from {}: {source}", .path.display())]
    Credentials {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed monit credentials, expected 'user:password'")]
    MalformedCredentials,

    #[error("monit unavailable: {0}")]
    Unavailable(String),
}

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{stage}: {source}")]
    Monit {
        stage: String,
        #[source]
        source: MonitError,
    },

    #[error("Failed to reload monit: before={before} after={after}")]
    ReloadTimeout { before: i64, after: i64 },

    #[error("Timed out waiting for services '{}' to stop after 10 minutes", .services.join(", "))]
    StopTimeout { services: Vec<String> },

    #[error("Stopping service '{service}' errored with message '{message}'")]
    ServiceErrored { service: String, message: String },

    #[error("Starting monit after {attempts} attempts: {source}")]
    StartMonit {
        attempts: usize,
        #[source]
        source: CmdError,
    },

    #[error("{stage}: {source}")]
    Config {
        stage: String,
        #[source]
        source: io::Error,
    },

    #[error("Listen for SMTP on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn monit(stage: impl Into<String>, source: MonitError) -> Self {
        Self::Monit {
            stage: stage.into(),
            source,
        }
    }

    pub(crate) fn config(stage: impl Into<String>, source: io::Error) -> Self {
        Self::Config {
            stage: stage.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SupervisorError::ReloadTimeout {
            before: 5,
            after: 5,
        };
        assert_eq!(err.to_string(), "Failed to reload monit: before=5 after=5");

        let err = SupervisorError::StopTimeout {
            services: vec!["nats".to_string(), "redis".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for services 'nats, redis' to stop after 10 minutes"
        );

        let err = SupervisorError::monit(
            "Starting service nats",
            MonitError::Unavailable("connection refused".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Starting service nats: monit unavailable: connection refused"
        );
    }
}
