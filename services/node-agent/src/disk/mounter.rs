//! Mounting, unmounting, and mount table queries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::system::CmdRunner;

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub partition_path: String,
    pub mount_point: String,
}

impl Mount {
    pub fn new(partition_path: &str, mount_point: &str) -> Self {
        Self {
            partition_path: partition_path.to_string(),
            mount_point: mount_point.to_string(),
        }
    }
}

/// Source of the current mount table.
#[async_trait]
pub trait MountsSearcher: Send + Sync {
    async fn search_mounts(&self) -> Result<Vec<Mount>>;
}

/// Reads the mount table from `/proc/mounts`.
pub struct ProcMountsSearcher {
    path: PathBuf,
}

impl ProcMountsSearcher {
    pub fn new() -> Self {
        Self::with_path("/proc/mounts")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMountsSearcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `/proc/mounts` content.
fn parse_proc_mounts(content: &str) -> Vec<Mount> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let partition = fields.next()?;
            let mount_point = fields.next()?;
            Some(Mount::new(partition, &unescape_mount_field(mount_point)))
        })
        .collect()
}

/// Undo the octal escaping `/proc/mounts` applies to spaces and tabs.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\134", "\\")
}

#[async_trait]
impl MountsSearcher for ProcMountsSearcher {
    async fn search_mounts(&self) -> Result<Vec<Mount>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(parse_proc_mounts(&content))
    }
}

/// Mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount a partition with the given options.
    async fn mount(&self, partition: &str, mount_point: &Path, options: &[String]) -> Result<()>;

    /// Unmount a mount point or device.
    ///
    /// Returns `false` when nothing was mounted there.
    async fn unmount(&self, mount_point_or_device: &str) -> Result<bool>;

    /// Mount `source` with an explicit filesystem type, e.g. `tmpfs` or a
    /// bind mount (empty type, `bind` option).
    async fn mount_filesystem(
        &self,
        source: &str,
        mount_point: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    /// Move whatever is mounted at `from` to `to`.
    async fn remount(&self, from: &Path, to: &Path, options: &[String]) -> Result<()>;

    /// Remount a mount point read-only in place.
    async fn remount_as_readonly(&self, mount_point: &Path) -> Result<()>;

    /// Remount a mount point in place with extra options.
    async fn remount_in_place(&self, mount_point: &Path, options: &[String]) -> Result<()>;

    /// Activate a swap partition.
    async fn swap_on(&self, partition: &str) -> Result<()>;

    /// Device mounted at `path`, or `None` when it is not a mount point.
    async fn is_mount_point(&self, path: &Path) -> Result<Option<String>>;

    /// Whether a device or mount point appears in the mount table.
    async fn is_mounted(&self, device_or_mount_point: &str) -> Result<bool>;
}

/// Mounts with `mount(8)` and friends.
pub struct LinuxMounter {
    runner: Arc<dyn CmdRunner>,
    mounts: Arc<dyn MountsSearcher>,
    swaps_path: PathBuf,
}

impl LinuxMounter {
    pub fn new(runner: Arc<dyn CmdRunner>, mounts: Arc<dyn MountsSearcher>) -> Self {
        Self {
            runner,
            mounts,
            swaps_path: PathBuf::from("/proc/swaps"),
        }
    }

    pub fn with_swaps_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.swaps_path = path.into();
        self
    }

    async fn active_swaps(&self) -> Result<HashSet<String>> {
        let content = match tokio::fs::read_to_string(&self.swaps_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", self.swaps_path.display())))
            }
        };

        Ok(content
            .lines()
            .skip(1)
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }
}

fn mount_args(partition: &str, mount_point: &Path, options: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    if !options.is_empty() {
        args.push("-o".to_string());
        args.push(options.join(","));
    }
    args.push(partition.to_string());
    args.push(mount_point.to_string_lossy().to_string());
    args
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn mount(&self, partition: &str, mount_point: &Path, options: &[String]) -> Result<()> {
        info!(partition = %partition, mount_point = %mount_point.display(), "Mounting");
        let args = mount_args(partition, mount_point, options);
        self.runner.run_command("mount", &args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        Ok(())
    }

    async fn mount_filesystem(
        &self,
        source: &str,
        mount_point: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        info!(source = %source, mount_point = %mount_point.display(), fs_type = %fs_type, "Mounting filesystem");
        let mut args = Vec::new();
        if !fs_type.is_empty() {
            args.push("-t".to_string());
            args.push(fs_type.to_string());
        }
        args.extend(mount_args(source, mount_point, options));
        self.runner.run_command("mount", &args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        Ok(())
    }

    async fn unmount(&self, mount_point_or_device: &str) -> Result<bool> {
        if !self.is_mounted(mount_point_or_device).await? {
            debug!(target_path = %mount_point_or_device, "Not mounted");
            return Ok(false);
        }

        info!(target_path = %mount_point_or_device, "Unmounting");
        self.runner
            .run_command("umount", &[mount_point_or_device])
            .await?;
        Ok(true)
    }

    async fn remount(&self, from: &Path, to: &Path, options: &[String]) -> Result<()> {
        let partition = self
            .is_mount_point(from)
            .await?
            .with_context(|| format!("{} is not a mount point", from.display()))?;

        let from_str = from.to_string_lossy();
        self.unmount(&from_str).await?;
        self.mount(&partition, to, options).await
    }

    async fn remount_as_readonly(&self, mount_point: &Path) -> Result<()> {
        info!(mount_point = %mount_point.display(), "Remounting read-only");
        self.remount_in_place(mount_point, &["ro".to_string()]).await
    }

    async fn remount_in_place(&self, mount_point: &Path, options: &[String]) -> Result<()> {
        let mut remount = vec!["remount".to_string()];
        remount.extend(options.iter().cloned());
        let remount = remount.join(",");
        let mount_point = mount_point.to_string_lossy();
        self.runner
            .run_command("mount", &["-o", &remount, &mount_point])
            .await?;
        Ok(())
    }

    async fn swap_on(&self, partition: &str) -> Result<()> {
        if self.active_swaps().await?.contains(partition) {
            debug!(partition = %partition, "Swap already active");
            return Ok(());
        }

        info!(partition = %partition, "Enabling swap");
        self.runner.run_command("swapon", &[partition]).await?;
        Ok(())
    }

    async fn is_mount_point(&self, path: &Path) -> Result<Option<String>> {
        let path = path.to_string_lossy();
        let mounts = self.mounts.search_mounts().await?;
        Ok(mounts
            .into_iter()
            .find(|m| m.mount_point == path)
            .map(|m| m.partition_path))
    }

    async fn is_mounted(&self, device_or_mount_point: &str) -> Result<bool> {
        let mounts = self.mounts.search_mounts().await?;
        Ok(mounts.iter().any(|m| {
            m.partition_path == device_or_mount_point || m.mount_point == device_or_mount_point
        }))
    }
}

/// Mock mounts searcher for testing.
pub struct MockMountsSearcher {
    mounts: Mutex<Vec<Mount>>,
    error: Mutex<Option<String>>,
}

impl MockMountsSearcher {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self {
            mounts: Mutex::new(mounts),
            error: Mutex::new(None),
        }
    }

    pub fn set_mounts(&self, mounts: Vec<Mount>) {
        *self.mounts.lock().unwrap_or_else(|e| e.into_inner()) = mounts;
    }

    /// Fail every search.
    pub fn fail(&self, message: &str) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }
}

impl Default for MockMountsSearcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl MountsSearcher for MockMountsSearcher {
    async fn search_mounts(&self) -> Result<Vec<Mount>> {
        if let Some(message) = self.error.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            anyhow::bail!("{}", message);
        }
        Ok(self.mounts.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Call recorded by [`MockMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        partition: String,
        mount_point: PathBuf,
        options: Vec<String>,
    },
    MountFilesystem {
        source: String,
        mount_point: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    Unmount(String),
    Remount {
        from: PathBuf,
        to: PathBuf,
        options: Vec<String>,
    },
    RemountReadOnly(PathBuf),
    RemountInPlace {
        mount_point: PathBuf,
        options: Vec<String>,
    },
    SwapOn(String),
}

#[derive(Default)]
struct MockMounterState {
    calls: Vec<MountCall>,
    mount_points: Vec<(PathBuf, String)>,
    mounted: HashSet<String>,
    unmount_result: Option<bool>,
    mount_error: Option<String>,
    unmount_error: Option<String>,
    is_mount_point_error: Option<String>,
    is_mounted_error: Option<String>,
    remount_error: Option<String>,
}

/// Mock mounter for testing.
pub struct MockMounter {
    state: Mutex<MockMounterState>,
}

impl MockMounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockMounterState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockMounterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report `device` as mounted at `path`.
    pub fn set_mount_point(&self, path: impl Into<PathBuf>, device: &str) {
        self.state().mount_points.push((path.into(), device.to_string()));
    }

    /// Report a device or mount point as mounted.
    pub fn set_mounted(&self, device_or_mount_point: &str) {
        self.state().mounted.insert(device_or_mount_point.to_string());
    }

    /// Force the result of every unmount call.
    pub fn set_unmount_result(&self, unmounted: bool) {
        self.state().unmount_result = Some(unmounted);
    }

    pub fn fail_mount(&self, message: &str) {
        self.state().mount_error = Some(message.to_string());
    }

    pub fn fail_unmount(&self, message: &str) {
        self.state().unmount_error = Some(message.to_string());
    }

    pub fn fail_is_mount_point(&self, message: &str) {
        self.state().is_mount_point_error = Some(message.to_string());
    }

    pub fn fail_is_mounted(&self, message: &str) {
        self.state().is_mounted_error = Some(message.to_string());
    }

    pub fn fail_remount(&self, message: &str) {
        self.state().remount_error = Some(message.to_string());
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<MountCall> {
        self.state().calls.clone()
    }

    /// Mount calls only, as (partition, mount point, options).
    pub fn mounts(&self) -> Vec<(String, PathBuf, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::Mount {
                    partition,
                    mount_point,
                    options,
                } => Some((partition, mount_point, options)),
                _ => None,
            })
            .collect()
    }

    /// Filesystem mounts only, as (source, mount point, type, options).
    pub fn filesystem_mounts(&self) -> Vec<(String, PathBuf, String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::MountFilesystem {
                    source,
                    mount_point,
                    fs_type,
                    options,
                } => Some((source, mount_point, fs_type, options)),
                _ => None,
            })
            .collect()
    }

    /// In-place remounts only, as (mount point, options).
    pub fn remounts_in_place(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::RemountInPlace {
                    mount_point,
                    options,
                } => Some((mount_point, options)),
                _ => None,
            })
            .collect()
    }

    /// Partitions passed to swap_on.
    pub fn swap_ons(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::SwapOn(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl Default for MockMounter {
    fn default() -> Self {
        Self::new()
    }
}

fn mock_result(error: &Option<String>) -> Result<()> {
    match error {
        Some(message) => Err(anyhow::anyhow!("{}", message)),
        None => Ok(()),
    }
}

#[async_trait]
impl Mounter for MockMounter {
    async fn mount(&self, partition: &str, mount_point: &Path, options: &[String]) -> Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::Mount {
            partition: partition.to_string(),
            mount_point: mount_point.to_path_buf(),
            options: options.to_vec(),
        });
        mock_result(&state.mount_error)
    }

    async fn mount_filesystem(
        &self,
        source: &str,
        mount_point: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::MountFilesystem {
            source: source.to_string(),
            mount_point: mount_point.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        mock_result(&state.mount_error)
    }

    async fn unmount(&self, mount_point_or_device: &str) -> Result<bool> {
        let mut state = self.state();
        state
            .calls
            .push(MountCall::Unmount(mount_point_or_device.to_string()));
        mock_result(&state.unmount_error)?;
        Ok(state
            .unmount_result
            .unwrap_or_else(|| state.mounted.contains(mount_point_or_device)))
    }

    async fn remount(&self, from: &Path, to: &Path, options: &[String]) -> Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::Remount {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            options: options.to_vec(),
        });
        mock_result(&state.remount_error)
    }

    async fn remount_as_readonly(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(MountCall::RemountReadOnly(mount_point.to_path_buf()));
        mock_result(&state.remount_error)
    }

    async fn remount_in_place(&self, mount_point: &Path, options: &[String]) -> Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::RemountInPlace {
            mount_point: mount_point.to_path_buf(),
            options: options.to_vec(),
        });
        mock_result(&state.remount_error)
    }

    async fn swap_on(&self, partition: &str) -> Result<()> {
        self.state()
            .calls
            .push(MountCall::SwapOn(partition.to_string()));
        Ok(())
    }

    async fn is_mount_point(&self, path: &Path) -> Result<Option<String>> {
        let state = self.state();
        mock_result(&state.is_mount_point_error)?;
        Ok(state
            .mount_points
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, device)| device.clone()))
    }

    async fn is_mounted(&self, device_or_mount_point: &str) -> Result<bool> {
        let state = self.state();
        mock_result(&state.is_mounted_error)?;
        Ok(state.mounted.contains(device_or_mount_point))
    }
}
