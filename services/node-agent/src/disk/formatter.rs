//! Filesystem creation.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::error::DiskError;
use crate::system::CmdRunner;

/// Filesystem a partition is formatted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemType {
    Swap,
    Ext4,
    Xfs,
}

impl FileSystemType {
    /// Name as reported by `blkid`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swap => "swap",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        }
    }

    /// Filesystem for a persistent disk: `ext4` when unset, `xfs` on request,
    /// anything else is rejected.
    pub fn for_persistent_disk(requested: Option<&str>) -> Result<Self, DiskError> {
        match requested {
            None | Some("") => Ok(Self::Ext4),
            Some(name) => match name.parse() {
                Ok(Self::Swap) | Err(_) => Err(DiskError::UnsupportedFilesystem(name.to_string())),
                Ok(fs) => Ok(fs),
            },
        }
    }
}

impl fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileSystemType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swap" => Ok(Self::Swap),
            "ext4" => Ok(Self::Ext4),
            "xfs" => Ok(Self::Xfs),
            other => Err(DiskError::UnsupportedFilesystem(other.to_string())),
        }
    }
}

/// Filesystem formatter.
#[async_trait]
pub trait Formatter: Send + Sync {
    /// Format a partition, leaving it alone if it already has this filesystem.
    async fn format(&self, partition: &str, fs: FileSystemType) -> Result<()>;
}

/// Formats partitions with the standard Linux tools.
pub struct LinuxFormatter {
    runner: Arc<dyn CmdRunner>,
}

impl LinuxFormatter {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }

    /// Current filesystem type, if `blkid` recognizes one.
    async fn current_type(&self, partition: &str) -> Option<String> {
        let out = self
            .runner
            .run_command("blkid", &["-p", "-o", "value", "-s", "TYPE", partition])
            .await
            .ok()?;
        let fs = out.stdout.trim();
        (!fs.is_empty()).then(|| fs.to_string())
    }
}

#[async_trait]
impl Formatter for LinuxFormatter {
    async fn format(&self, partition: &str, fs: FileSystemType) -> Result<()> {
        if self.current_type(partition).await.as_deref() == Some(fs.as_str()) {
            info!(partition = %partition, fs = %fs, "Partition already formatted");
            return Ok(());
        }

        info!(partition = %partition, fs = %fs, "Formatting partition");
        match fs {
            FileSystemType::Swap => {
                self.runner.run_command("mkswap", &[partition]).await?;
            }
            FileSystemType::Ext4 => {
                self.runner
                    .run_command("mke2fs", &["-t", "ext4", "-j", partition])
                    .await?;
            }
            FileSystemType::Xfs => {
                self.runner.run_command("mkfs.xfs", &[partition]).await?;
            }
        }
        Ok(())
    }
}

/// Mock formatter for testing.
pub struct MockFormatter {
    calls: Mutex<Vec<(String, FileSystemType)>>,
    error: Mutex<Option<String>>,
}

impl MockFormatter {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    /// Fail every format call.
    pub fn fail(&self, message: &str) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    /// Partition and filesystem of every call.
    pub fn calls(&self) -> Vec<(String, FileSystemType)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Partitions formatted, in order.
    pub fn partitions(&self) -> Vec<String> {
        self.calls().into_iter().map(|(p, _)| p).collect()
    }
}

impl Default for MockFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Formatter for MockFormatter {
    async fn format(&self, partition: &str, fs: FileSystemType) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((partition.to_string(), fs));

        match self.error.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}
