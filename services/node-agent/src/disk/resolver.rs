//! Device path resolution.
//!
//! Turns [`DiskSettings`] into the real device path on this node. A disk that
//! has not appeared yet is reported as [`ResolveError::TimedOut`], distinct
//! from a hard failure, since attach and detach race with the agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::settings::{DevicePathResolutionType, DiskSettings};
use crate::system::{poll_until, Clock, Poll, PollError, PollOptions};

/// Errors from device path resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Timed out resolving device path for disk '{disk}'")]
    TimedOut { disk: String },

    #[error("Resolving device path for disk '{disk}': {source:#}")]
    Failed {
        disk: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ResolveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Device path resolution interface.
#[async_trait]
pub trait DevicePathResolver: Send + Sync {
    /// Real, absolute device path for the disk.
    async fn resolve(&self, settings: &DiskSettings) -> Result<String, ResolveError>;
}

/// Resolves device paths by waiting for device nodes to appear.
pub struct DevDirResolver {
    mode: DevicePathResolutionType,
    clock: Arc<dyn Clock>,
    dev_dir: PathBuf,
    timeout: Duration,
    interval: Duration,
}

impl DevDirResolver {
    /// Create a resolver over `/dev`.
    pub fn new(mode: DevicePathResolutionType, clock: Arc<dyn Clock>) -> Self {
        Self {
            mode,
            clock,
            dev_dir: PathBuf::from("/dev"),
            timeout: Duration::from_secs(60),
            interval: Duration::from_millis(500),
        }
    }

    /// Look up by-id and mapper entries under another directory.
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    /// How long to wait for a device node to appear.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn candidate(&self, settings: &DiskSettings) -> anyhow::Result<Option<PathBuf>> {
        match self.mode {
            DevicePathResolutionType::Identity => {
                if settings.path.is_empty() {
                    anyhow::bail!("disk has no device path");
                }
                let path = PathBuf::from(&settings.path);
                Ok(path.exists().then_some(path))
            }
            DevicePathResolutionType::ById => {
                if settings.id.is_empty() {
                    anyhow::bail!("disk has no id");
                }
                find_by_id(&self.dev_dir.join("disk").join("by-id"), &settings.id)
            }
            DevicePathResolutionType::Multipath => {
                if settings.id.is_empty() {
                    anyhow::bail!("disk has no id");
                }
                let path = self.dev_dir.join("mapper").join(&settings.id);
                Ok(path.exists().then_some(path))
            }
        }
    }
}

/// Find a by-id entry naming the disk id, ignoring partition entries.
fn find_by_id(by_id_dir: &Path, id: &str) -> anyhow::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(by_id_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.contains(id) && !name.contains("-part") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[async_trait]
impl DevicePathResolver for DevDirResolver {
    async fn resolve(&self, settings: &DiskSettings) -> Result<String, ResolveError> {
        let disk = settings.display_name().to_string();
        let disk_ref = &disk;

        let found = poll_until(
            self.clock.as_ref(),
            PollOptions::deadline(self.timeout, self.interval),
            || async move {
                match self.candidate(settings) {
                    Ok(Some(path)) => Ok(Poll::Ready(path)),
                    Ok(None) => {
                        debug!(disk = %disk_ref, "Waiting for device to appear");
                        Ok(Poll::Pending)
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .map_err(|e| match e {
            PollError::Check(source) => ResolveError::Failed {
                disk: disk.clone(),
                source,
            },
            PollError::Exhausted { .. } | PollError::DeadlineExceeded { .. } => {
                ResolveError::TimedOut { disk: disk.clone() }
            }
        })?;

        let real = tokio::fs::canonicalize(&found)
            .await
            .map_err(|e| ResolveError::Failed {
                disk: disk.clone(),
                source: anyhow::Error::new(e)
                    .context(format!("resolving symlink {}", found.display())),
            })?;

        debug!(disk = %disk, device = %real.display(), "Resolved device path");
        Ok(real.to_string_lossy().to_string())
    }
}

enum MockResolution {
    Path(String),
    TimedOut,
    Failed(String),
}

/// Mock resolver for testing.
///
/// Disks without a scripted answer resolve to their path hint.
pub struct MockResolver {
    answers: Mutex<HashMap<String, MockResolution>>,
    calls: Mutex<Vec<DiskSettings>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the disk named `disk` (id, or path when no id) to `path`.
    pub fn set_path(&self, disk: &str, path: &str) {
        self.set(disk, MockResolution::Path(path.to_string()));
    }

    /// Report a timeout for the disk.
    pub fn set_timed_out(&self, disk: &str) {
        self.set(disk, MockResolution::TimedOut);
    }

    /// Report a hard failure for the disk.
    pub fn set_failure(&self, disk: &str, message: &str) {
        self.set(disk, MockResolution::Failed(message.to_string()));
    }

    /// Settings passed to every resolve call.
    pub fn calls(&self) -> Vec<DiskSettings> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, disk: &str, answer: MockResolution) {
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(disk.to_string(), answer);
    }
}

impl Default for MockResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePathResolver for MockResolver {
    async fn resolve(&self, settings: &DiskSettings) -> Result<String, ResolveError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(settings.clone());

        let disk = settings.display_name().to_string();
        let answers = self.answers.lock().unwrap_or_else(|e| e.into_inner());
        match answers.get(&disk) {
            Some(MockResolution::Path(path)) => Ok(path.clone()),
            Some(MockResolution::TimedOut) => Err(ResolveError::TimedOut { disk }),
            Some(MockResolution::Failed(message)) => Err(ResolveError::Failed {
                disk,
                source: anyhow::anyhow!("{}", message),
            }),
            None => Ok(settings.path.clone()),
        }
    }
}
