//! Disk layout manager.
//!
//! Holds the collaborators every disk operation drives. The operations
//! themselves live in `layout` (ephemeral disks, root growth, raw disks) and
//! `persistent` (persistent disk mount, unmount, migration).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::device::split_partition_path;
use super::error::DiskError;
use super::formatter::{Formatter, LinuxFormatter};
use super::mounter::{LinuxMounter, Mounter, MountsSearcher, ProcMountsSearcher};
use super::partitioner::Partitioners;
use super::resolver::{DevDirResolver, DevicePathResolver};
use crate::config::{AgentPaths, DiskOptions};
use crate::state::StateStore;
use crate::system::{Clock, CmdRunner, MemoryStats, ProcMemoryStats};

/// External collaborators of the disk layout manager.
#[derive(Clone)]
pub struct DiskCollaborators {
    pub runner: Arc<dyn CmdRunner>,
    pub resolver: Arc<dyn DevicePathResolver>,
    pub partitioners: Partitioners,
    pub formatter: Arc<dyn Formatter>,
    pub mounter: Arc<dyn Mounter>,
    pub mounts: Arc<dyn MountsSearcher>,
    pub memory: Arc<dyn MemoryStats>,
}

impl DiskCollaborators {
    /// Collaborators backed by the host's tools and `/proc`.
    pub fn linux(runner: Arc<dyn CmdRunner>, clock: Arc<dyn Clock>, options: &DiskOptions) -> Self {
        let mounts: Arc<dyn MountsSearcher> = Arc::new(ProcMountsSearcher::new());
        Self {
            resolver: Arc::new(DevDirResolver::new(
                options.device_path_resolution_type,
                clock,
            )),
            partitioners: Partitioners::standard(runner.clone()),
            formatter: Arc::new(LinuxFormatter::new(runner.clone())),
            mounter: Arc::new(LinuxMounter::new(runner.clone(), mounts.clone())),
            mounts,
            memory: Arc::new(ProcMemoryStats::new()),
            runner,
        }
    }
}

/// Computes and applies disk layouts on this node.
pub struct DiskManager {
    pub(super) runner: Arc<dyn CmdRunner>,
    pub(super) resolver: Arc<dyn DevicePathResolver>,
    pub(super) partitioners: Partitioners,
    pub(super) formatter: Arc<dyn Formatter>,
    pub(super) mounter: Arc<dyn Mounter>,
    pub(super) mounts: Arc<dyn MountsSearcher>,
    pub(super) memory: Arc<dyn MemoryStats>,
    pub(super) state: StateStore,
    pub(super) paths: AgentPaths,
    pub(super) options: DiskOptions,
    pub(super) passwd_path: PathBuf,
}

impl DiskManager {
    pub fn new(collaborators: DiskCollaborators, paths: AgentPaths, options: DiskOptions) -> Self {
        Self {
            runner: collaborators.runner,
            resolver: collaborators.resolver,
            partitioners: collaborators.partitioners,
            formatter: collaborators.formatter,
            mounter: collaborators.mounter,
            mounts: collaborators.mounts,
            memory: collaborators.memory,
            state: StateStore::new(paths.clone()),
            paths,
            options,
            passwd_path: PathBuf::from("/etc/passwd"),
        }
    }

    /// Read system users from another passwd file.
    pub fn with_passwd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.passwd_path = path.into();
        self
    }

    pub fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    pub fn options(&self) -> &DiskOptions {
        &self.options
    }

    /// Real path, whole disk and index of the partition mounted at `/`.
    ///
    /// The `rootfs` pseudo entry some kernels report is skipped.
    pub(super) async fn find_root_partition(&self) -> Result<RootPartition, DiskError> {
        const STAGE: &str = "Finding root partition device";

        let mounts = self
            .mounts
            .search_mounts()
            .await
            .map_err(|e| DiskError::io(STAGE, e))?;

        let root = mounts
            .iter()
            .find(|m| m.mount_point == "/" && m.partition_path != "rootfs")
            .ok_or_else(|| DiskError::io(STAGE, anyhow::anyhow!("no device is mounted at /")))?;

        let out = self
            .runner
            .run_command("readlink", &["-f", &root.partition_path])
            .await
            .map_err(|e| DiskError::command(STAGE, e))?;
        let real_path = out.stdout.trim().to_string();

        let (disk, index) = split_partition_path(&real_path).ok_or_else(|| {
            DiskError::io(
                STAGE,
                anyhow::anyhow!("root device '{}' is not a partition", real_path),
            )
        })?;

        debug!(partition = %real_path, disk = %disk, index, "Found root partition");
        Ok(RootPartition {
            path: real_path,
            disk,
            index,
        })
    }
}

/// The partition mounted at `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RootPartition {
    pub path: String,
    pub disk: String,
    pub index: u32,
}

/// Point `link` at `target`, replacing whatever link was there.
pub(super) async fn replace_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(link).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::symlink(target, link).await
}

/// Create a directory (and parents) with the given mode.
pub(super) async fn create_dir(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder.create(path).await
}
