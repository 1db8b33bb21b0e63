//! Ephemeral disk setup, root filesystem growth, and raw disk labeling.

use tracing::{info, warn};

use super::device::partition_path;
use super::error::DiskError;
use super::formatter::FileSystemType;
use super::manager::{create_dir, DiskManager};
use super::partition::{ephemeral_partition_plan, PartitionPlan, PartitionType};
use super::settings::DiskSettings;
use crate::system::{CmdError, CmdOutput};

/// Smallest free space on the root disk worth carving ephemeral partitions from.
pub const MIN_ROOT_EPHEMERAL_SPACE: u64 = 1024 * 1024 * 1024;

const UNRECOGNISED_LABEL: &str = "unrecognised disk label";

/// Partitions created for ephemeral storage.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EphemeralPartitions {
    swap: Option<String>,
    data: String,
}

impl EphemeralPartitions {
    /// Paths of a plan's partitions, numbered from `first_index` on `device`.
    fn from_plan(device: &str, plan: &PartitionPlan, first_index: u32) -> Self {
        let swap = plan
            .first()
            .filter(|p| p.partition_type == PartitionType::Swap)
            .map(|_| partition_path(device, first_index));
        let data = partition_path(device, first_index + plan.len() as u32 - 1);
        Self { swap, data }
    }
}

impl DiskManager {
    /// Prepare ephemeral storage and mount it at the data directory.
    ///
    /// `device` is the ephemeral disk, or `None` to fall back to free space on
    /// the root disk when configuration allows it. The disk is always
    /// repartitioned.
    pub async fn setup_ephemeral_disk(
        &self,
        device: Option<&str>,
        desired_swap: Option<u64>,
    ) -> Result<(), DiskError> {
        let data_dir = self.paths.data_dir();
        create_dir(&data_dir, 0o750)
            .await
            .map_err(|e| DiskError::io("Creating data dir", e))?;

        if self.options.skip_disk_setup {
            info!("Skipping ephemeral disk setup");
            return Ok(());
        }

        let partitions = match device.filter(|d| !d.is_empty()) {
            Some(device) => self.partition_ephemeral_disk(device, desired_swap).await?,
            None if self.options.create_partition_if_no_ephemeral_disk => {
                self.partition_root_for_ephemeral(desired_swap).await?
            }
            None => {
                warn!("No ephemeral disk found and root disk partitioning is disabled");
                return Err(DiskError::RootAsEphemeral);
            }
        };

        if let Some(swap) = &partitions.swap {
            self.formatter
                .format(swap, FileSystemType::Swap)
                .await
                .map_err(|e| DiskError::format(format!("Formatting swap partition '{}'", swap), e))?;
        }

        let data = &partitions.data;
        self.formatter
            .format(data, FileSystemType::Ext4)
            .await
            .map_err(|e| {
                DiskError::format(format!("Formatting data partition '{}' with ext4", data), e)
            })?;

        self.mounter
            .mount(data, &data_dir, &[])
            .await
            .map_err(|e| DiskError::mount(format!("Mounting data partition '{}'", data), e))?;

        if self.options.scrub_ephemeral_disk {
            self.scrub_ephemeral_data().await?;
        }

        if let Some(swap) = &partitions.swap {
            self.mounter
                .swap_on(swap)
                .await
                .map_err(|e| DiskError::mount(format!("Enabling swap on '{}'", swap), e))?;
        }

        info!(data = %data, swap = ?partitions.swap, "Ephemeral disk ready");
        Ok(())
    }

    async fn partition_ephemeral_disk(
        &self,
        device: &str,
        desired_swap: Option<u64>,
    ) -> Result<EphemeralPartitions, DiskError> {
        let partitioner = self.partitioners.default_partitioner();

        let size = partitioner.device_size_bytes(device).await.map_err(|e| {
            DiskError::partition(format!("Getting size of ephemeral disk '{}'", device), e)
        })?;
        let plan = self.ephemeral_plan(size, desired_swap).await?;

        info!(device = %device, size, partitions = plan.len(), "Partitioning ephemeral disk");
        partitioner.partition(device, &plan).await.map_err(|e| {
            DiskError::partition(format!("Partitioning ephemeral disk '{}'", device), e)
        })?;

        Ok(EphemeralPartitions::from_plan(device, &plan, 1))
    }

    async fn partition_root_for_ephemeral(
        &self,
        desired_swap: Option<u64>,
    ) -> Result<EphemeralPartitions, DiskError> {
        let root = self.find_root_partition().await?;
        let partitioner = self.partitioners.root();

        let remaining = partitioner
            .device_size_bytes(&root.disk)
            .await
            .map_err(|e| DiskError::partition("Getting root device remaining size", e))?;
        if remaining < MIN_ROOT_EPHEMERAL_SPACE {
            return Err(DiskError::InsufficientSpace {
                available: remaining,
                minimum: MIN_ROOT_EPHEMERAL_SPACE,
            });
        }

        let plan = self.ephemeral_plan(remaining, desired_swap).await?;

        info!(device = %root.disk, remaining, partitions = plan.len(), "Partitioning root device");
        partitioner.partition(&root.disk, &plan).await.map_err(|e| {
            DiskError::partition(format!("Partitioning root device '{}'", root.disk), e)
        })?;

        Ok(EphemeralPartitions::from_plan(&root.disk, &plan, root.index + 1))
    }

    async fn ephemeral_plan(
        &self,
        device_size: u64,
        desired_swap: Option<u64>,
    ) -> Result<PartitionPlan, DiskError> {
        const STAGE: &str = "Calculating partition sizes";

        let total_memory = match desired_swap {
            Some(_) => 0,
            None => self
                .memory
                .total_memory_bytes()
                .await
                .map_err(|e| DiskError::partition(STAGE, e))?,
        };

        ephemeral_partition_plan(device_size, desired_swap, total_memory).ok_or_else(|| {
            DiskError::partition(
                STAGE,
                anyhow::anyhow!(
                    "requested swap size {:?} exceeds device size {}",
                    desired_swap,
                    device_size
                ),
            )
        })
    }

    /// Wipe the data directory when it was prepared for another stemcell.
    async fn scrub_ephemeral_data(&self) -> Result<(), DiskError> {
        const STAGE: &str = "Scrubbing ephemeral disk";

        let stemcell_version = self
            .state
            .stemcell_version()
            .await
            .map_err(|source| DiskError::State {
                stage: STAGE.to_string(),
                source,
            })?;
        let agent_version = self
            .state
            .agent_version()
            .await
            .map_err(|source| DiskError::State {
                stage: STAGE.to_string(),
                source,
            })?;

        if agent_version.as_deref() == Some(stemcell_version.as_str()) {
            return Ok(());
        }

        info!(
            stemcell_version = %stemcell_version,
            previous = ?agent_version,
            "Stemcell changed, scrubbing ephemeral data"
        );

        let data_dir = self.paths.data_dir();
        let mut entries = tokio::fs::read_dir(&data_dir)
            .await
            .map_err(|e| DiskError::io(STAGE, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DiskError::io(STAGE, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| DiskError::io(STAGE, e))?;
            let removed = if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            removed.map_err(|e| DiskError::io(format!("{}: removing {}", STAGE, path.display()), e))?;
        }

        self.state
            .write_agent_version(&stemcell_version)
            .await
            .map_err(|source| DiskError::State {
                stage: STAGE.to_string(),
                source,
            })
    }

    /// Grow the root partition and filesystem into free space on the root disk.
    ///
    /// Only done when an ephemeral disk exists elsewhere and `growpart` is
    /// installed.
    pub async fn grow_root_filesystem(&self, ephemeral_disk: Option<&str>) -> Result<(), DiskError> {
        if self.options.skip_disk_setup {
            return Ok(());
        }
        if !self.runner.exists("growpart") {
            info!("growpart not installed, skipping root filesystem growth");
            return Ok(());
        }
        if ephemeral_disk.map_or(true, str::is_empty) {
            info!("No ephemeral disk, skipping root filesystem growth");
            return Ok(());
        }

        let root = self.find_root_partition().await?;
        let index = root.index.to_string();

        info!(disk = %root.disk, index = root.index, "Growing root partition");
        self.runner
            .run_command("growpart", &[&root.disk, &index])
            .await
            .map_err(|e| DiskError::command("Growing root partition", e))?;

        self.runner
            .run_command("resize2fs", &["-f", &root.path])
            .await
            .map_err(|e| DiskError::command("Resizing root filesystem", e))?;

        Ok(())
    }

    /// Give each raw ephemeral disk a GPT label with one full-disk partition.
    ///
    /// Disks that already carry a partition are left alone.
    pub async fn label_raw_ephemeral_disks(&self, disks: &[DiskSettings]) -> Result<(), DiskError> {
        if self.options.skip_disk_setup {
            return Ok(());
        }

        for (index, disk) in disks.iter().enumerate() {
            let device = self.resolver.resolve(disk).await?;

            let table = self
                .runner
                .run_command("parted", &["-s", &device, "p"])
                .await;
            let needs_label = raw_disk_needs_label(table).map_err(|e| {
                DiskError::command(format!("Checking partition table of raw disk '{}'", device), e)
            })?;

            if !needs_label {
                info!(device = %device, "Raw ephemeral disk already partitioned");
                continue;
            }

            let name = format!("raw-ephemeral-{}", index);
            info!(device = %device, name = %name, "Labeling raw ephemeral disk");
            self.runner
                .run_command(
                    "parted",
                    &["-s", &device, "mklabel", "gpt", "unit", "%", "mkpart", &name, "0", "100"],
                )
                .await
                .map_err(|e| DiskError::command(format!("Labeling raw disk '{}'", device), e))?;
        }
        Ok(())
    }
}

fn reports_unrecognised_label(output: &CmdOutput) -> bool {
    output.stdout.contains(UNRECOGNISED_LABEL) || output.stderr.contains(UNRECOGNISED_LABEL)
}

/// Whether `parted -s <dev> p` output lists at least one real partition.
///
/// A `loop` table is parted's view of a filesystem written straight onto the
/// disk, which counts as unpartitioned.
fn has_partitions(stdout: &str) -> bool {
    if stdout.contains("Partition Table: loop") {
        return false;
    }
    stdout.lines().any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|first| first.parse::<u32>().is_ok())
    })
}

/// Decide from a partition table listing whether the disk needs a label.
///
/// parted's "unrecognised disk label" message, on either stream and even
/// when parted exits non-zero, means the disk is blank. This relies on
/// parted's English message text.
fn raw_disk_needs_label(table: Result<CmdOutput, CmdError>) -> Result<bool, CmdError> {
    match table {
        Ok(output) => Ok(reports_unrecognised_label(&output) || !has_partitions(&output.stdout)),
        Err(CmdError::Failed { output, .. }) if reports_unrecognised_label(&output) => Ok(true),
        Err(e) => Err(e),
    }
}
