//! File-backed node state.
//!
//! - managed disk record: id of the disk mounted at the store directory
//! - stemcell version: version of the image the node booted from
//! - agent version marker: stemcell version the ephemeral data area was
//!   last prepared for
//!
//! Writes go through a temp file and rename so a crash never leaves a
//! partially written record behind.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::AgentPaths;

/// Errors from state file operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Node state files under the agent directories.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: AgentPaths,
}

impl StateStore {
    pub fn new(paths: AgentPaths) -> Self {
        Self { paths }
    }

    /// Id of the disk last mounted at the store directory, if any.
    pub async fn managed_disk_id(&self) -> Result<Option<String>, StateError> {
        read_optional(&self.paths.managed_disk_settings_path()).await
    }

    /// Record the disk now mounted at the store directory.
    pub async fn write_managed_disk_id(&self, disk_id: &str) -> Result<(), StateError> {
        let path = self.paths.managed_disk_settings_path();
        debug!(disk_id = %disk_id, path = %path.display(), "Writing managed disk record");
        write_atomic(&path, disk_id).await
    }

    /// Version of the stemcell the node booted from.
    pub async fn stemcell_version(&self) -> Result<String, StateError> {
        let path = self.paths.stemcell_version_path();
        tokio::fs::read_to_string(&path)
            .await
            .map(|v| v.trim().to_string())
            .map_err(|source| StateError::Read { path, source })
    }

    /// Stemcell version the ephemeral data area was prepared for.
    pub async fn agent_version(&self) -> Result<Option<String>, StateError> {
        Ok(read_optional(&self.paths.agent_version_path())
            .await?
            .map(|v| v.trim().to_string()))
    }

    /// Mark the ephemeral data area as prepared for `version`.
    pub async fn write_agent_version(&self, version: &str) -> Result<(), StateError> {
        write_atomic(&self.paths.agent_version_path(), version).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StateError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StateError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write `content` to `path` via a sibling temp file and rename.
async fn write_atomic(path: &Path, content: &str) -> Result<(), StateError> {
    let write_err = |source: io::Error| StateError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}
