//! Partition table writers.
//!
//! - `sfdisk`: default for ephemeral and persistent disks
//! - `parted`: persistent disks that ask for it by name (GPT, large disks)
//! - root device: appends partitions after the last one on the root disk

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::error::DiskError;
use super::partition::{Partition, PartitionType};
use crate::system::{CmdRunner, Command};

const MIB: u64 = 1024 * 1024;

/// Partition table writer.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Write `partitions` to the device, in order.
    async fn partition(&self, device: &str, partitions: &[Partition]) -> Result<()>;

    /// Bytes available for new partitions on the device.
    async fn device_size_bytes(&self, device: &str) -> Result<u64>;
}

async fn blockdev_size(runner: &dyn CmdRunner, device: &str) -> Result<u64> {
    let out = runner
        .run_command("blockdev", &["--getsize64", device])
        .await?;
    out.stdout
        .trim()
        .parse::<u64>()
        .with_context(|| format!("parsing size of {}: '{}'", device, out.stdout.trim()))
}

/// Partitions whole disks with `sfdisk`.
pub struct SfdiskPartitioner {
    runner: Arc<dyn CmdRunner>,
}

impl SfdiskPartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }
}

/// sfdisk script for a plan: one `,size,type` line per partition, the last
/// one taking the rest of the disk.
fn sfdisk_script(partitions: &[Partition]) -> String {
    let mut script = String::new();
    for (i, p) in partitions.iter().enumerate() {
        let kind = match p.partition_type {
            PartitionType::Swap => "S",
            PartitionType::Linux => "L",
        };
        if i == partitions.len() - 1 || p.size_in_bytes == 0 {
            script.push_str(&format!(",,{}\n", kind));
        } else {
            script.push_str(&format!(",{}M,{}\n", p.size_in_bytes / MIB, kind));
        }
    }
    script
}

#[async_trait]
impl Partitioner for SfdiskPartitioner {
    async fn partition(&self, device: &str, partitions: &[Partition]) -> Result<()> {
        if partitions.is_empty() {
            anyhow::bail!("no partitions requested for {}", device);
        }

        let script = sfdisk_script(partitions);
        info!(device = %device, partitions = partitions.len(), "Partitioning disk with sfdisk");
        debug!(device = %device, script = %script, "sfdisk input");

        let cmd = Command::new("sfdisk", &[device]).with_stdin(script);
        self.runner.run(&cmd).await?;
        Ok(())
    }

    async fn device_size_bytes(&self, device: &str) -> Result<u64> {
        blockdev_size(self.runner.as_ref(), device).await
    }
}

/// Partitions whole disks with a GPT label via `parted`.
pub struct PartedPartitioner {
    runner: Arc<dyn CmdRunner>,
}

impl PartedPartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Partitioner for PartedPartitioner {
    async fn partition(&self, device: &str, partitions: &[Partition]) -> Result<()> {
        info!(device = %device, partitions = partitions.len(), "Partitioning disk with parted");

        self.runner
            .run_command("parted", &["-s", device, "mklabel", "gpt"])
            .await?;

        let mut start = MIB;
        for (i, p) in partitions.iter().enumerate() {
            let name = format!("bosh-partition-{}", i);
            let start_arg = format!("{}B", start);
            let end_arg = if i == partitions.len() - 1 || p.size_in_bytes == 0 {
                "100%".to_string()
            } else {
                format!("{}B", start + p.size_in_bytes - 1)
            };

            self.runner
                .run_command(
                    "parted",
                    &["-s", device, "unit", "B", "mkpart", &name, &start_arg, &end_arg],
                )
                .await?;
            start += p.size_in_bytes;
        }
        Ok(())
    }

    async fn device_size_bytes(&self, device: &str) -> Result<u64> {
        blockdev_size(self.runner.as_ref(), device).await
    }
}

/// Layout of an existing disk as reported by `parted -m`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiskLayout {
    size: u64,
    /// End byte (inclusive) of the last partition.
    last_end: u64,
    count: usize,
}

fn parse_bytes(field: &str) -> Option<u64> {
    field.trim().trim_end_matches('B').parse().ok()
}

/// Parse `parted -m <dev> unit B print` output.
fn parse_parted_machine(output: &str) -> Option<DiskLayout> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    let mut size = None;
    let mut last_end = 0;
    let mut count = 0;

    for line in lines.by_ref() {
        if line == "BYT;" {
            continue;
        }
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        if size.is_none() {
            size = fields.get(1).and_then(|f| parse_bytes(f));
            continue;
        }
        if let Some(end) = fields.get(2).and_then(|f| parse_bytes(f)) {
            last_end = last_end.max(end);
            count += 1;
        }
    }

    size.map(|size| DiskLayout {
        size,
        last_end,
        count,
    })
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Adds partitions after the existing ones on the root disk.
///
/// [`Partitioner::device_size_bytes`] reports the free space that follows the
/// last partition, not the size of the whole disk.
pub struct RootDevicePartitioner {
    runner: Arc<dyn CmdRunner>,
}

impl RootDevicePartitioner {
    pub fn new(runner: Arc<dyn CmdRunner>) -> Self {
        Self { runner }
    }

    async fn layout(&self, device: &str) -> Result<DiskLayout> {
        let out = self
            .runner
            .run_command("parted", &["-m", device, "unit", "B", "print"])
            .await?;
        parse_parted_machine(&out.stdout)
            .with_context(|| format!("parsing partition table of {}", device))
    }
}

#[async_trait]
impl Partitioner for RootDevicePartitioner {
    async fn partition(&self, device: &str, partitions: &[Partition]) -> Result<()> {
        let layout = self.layout(device).await?;
        info!(
            device = %device,
            existing = layout.count,
            partitions = partitions.len(),
            "Adding partitions to root device"
        );

        let mut start = align_up(layout.last_end + 1, MIB);
        for (i, p) in partitions.iter().enumerate() {
            let fs = match p.partition_type {
                PartitionType::Swap => "linux-swap",
                PartitionType::Linux => "ext4",
            };
            let end = if i == partitions.len() - 1 || p.size_in_bytes == 0 {
                layout.size - 1
            } else {
                start + p.size_in_bytes - 1
            };
            if end <= start || end >= layout.size {
                anyhow::bail!(
                    "partition {} of {} does not fit ({}..{} of {} bytes)",
                    i,
                    device,
                    start,
                    end,
                    layout.size
                );
            }

            let start_arg = format!("{}", start);
            let end_arg = format!("{}", end);
            self.runner
                .run_command(
                    "parted",
                    &["-s", device, "unit", "B", "mkpart", "primary", fs, &start_arg, &end_arg],
                )
                .await?;
            start = align_up(end + 1, MIB);
        }
        Ok(())
    }

    async fn device_size_bytes(&self, device: &str) -> Result<u64> {
        let layout = self.layout(device).await?;
        let first_free = align_up(layout.last_end + 1, MIB);
        Ok(layout.size.saturating_sub(first_free))
    }
}

/// Partitioners by role and name.
#[derive(Clone)]
pub struct Partitioners {
    default: Arc<dyn Partitioner>,
    root: Arc<dyn Partitioner>,
    named: HashMap<String, Arc<dyn Partitioner>>,
}

impl Partitioners {
    /// The standard set: sfdisk by default, parted on request, and the root
    /// device partitioner.
    pub fn standard(runner: Arc<dyn CmdRunner>) -> Self {
        let sfdisk: Arc<dyn Partitioner> = Arc::new(SfdiskPartitioner::new(runner.clone()));
        let parted: Arc<dyn Partitioner> = Arc::new(PartedPartitioner::new(runner.clone()));
        let root: Arc<dyn Partitioner> = Arc::new(RootDevicePartitioner::new(runner));

        Self::new(sfdisk.clone(), root)
            .with_named("sfdisk", sfdisk)
            .with_named("parted", parted)
    }

    pub fn new(default: Arc<dyn Partitioner>, root: Arc<dyn Partitioner>) -> Self {
        Self {
            default,
            root,
            named: HashMap::new(),
        }
    }

    pub fn with_named(mut self, name: &str, partitioner: Arc<dyn Partitioner>) -> Self {
        self.named.insert(name.to_string(), partitioner);
        self
    }

    pub fn default_partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.default
    }

    pub fn root(&self) -> &Arc<dyn Partitioner> {
        &self.root
    }

    /// The partitioner a disk asked for, or the default.
    pub fn select(&self, name: Option<&str>) -> Result<&Arc<dyn Partitioner>, DiskError> {
        match name {
            None | Some("") => Ok(&self.default),
            Some(name) => self
                .named
                .get(name)
                .ok_or_else(|| DiskError::UnknownPartitioner(name.to_string())),
        }
    }
}

/// Mock partitioner for testing.
pub struct MockPartitioner {
    state: Mutex<MockPartitionerState>,
}

#[derive(Default)]
struct MockPartitionerState {
    sizes: HashMap<String, u64>,
    calls: Vec<(String, Vec<Partition>)>,
    partition_error: Option<String>,
    size_error: Option<String>,
}

impl MockPartitioner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockPartitionerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockPartitionerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Size reported for a device.
    pub fn set_device_size(&self, device: &str, size: u64) {
        self.state().sizes.insert(device.to_string(), size);
    }

    /// Fail every partition call.
    pub fn fail_partition(&self, message: &str) {
        self.state().partition_error = Some(message.to_string());
    }

    /// Fail every size query.
    pub fn fail_device_size(&self, message: &str) {
        self.state().size_error = Some(message.to_string());
    }

    /// Device and plan of every partition call.
    pub fn calls(&self) -> Vec<(String, Vec<Partition>)> {
        self.state().calls.clone()
    }

    pub fn was_called(&self) -> bool {
        !self.state().calls.is_empty()
    }
}

impl Default for MockPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Partitioner for MockPartitioner {
    async fn partition(&self, device: &str, partitions: &[Partition]) -> Result<()> {
        let mut state = self.state();
        state.calls.push((device.to_string(), partitions.to_vec()));
        match &state.partition_error {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    async fn device_size_bytes(&self, device: &str) -> Result<u64> {
        let state = self.state();
        if let Some(message) = &state.size_error {
            anyhow::bail!("{}", message);
        }
        Ok(state.sizes.get(device).copied().unwrap_or(0))
    }
}
