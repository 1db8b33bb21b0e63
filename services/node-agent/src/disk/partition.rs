//! Partition plans and ephemeral sizing policy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Filesystem role of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    Swap,
    Linux,
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swap => write!(f, "swap"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// A partition to create.
///
/// A size of zero on the last partition of a plan means "the rest of the
/// device".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub size_in_bytes: u64,
    pub partition_type: PartitionType,
}

impl Partition {
    pub fn swap(size_in_bytes: u64) -> Self {
        Self {
            size_in_bytes,
            partition_type: PartitionType::Swap,
        }
    }

    pub fn linux(size_in_bytes: u64) -> Self {
        Self {
            size_in_bytes,
            partition_type: PartitionType::Linux,
        }
    }
}

/// Ordered partitions applied to one device.
pub type PartitionPlan = Vec<Partition>;

/// Swap size when none was requested: total memory, capped at half the device.
pub fn default_swap_size(total_memory: u64, device_size: u64) -> u64 {
    if total_memory > device_size / 2 {
        device_size / 2
    } else {
        total_memory
    }
}

/// Plan swap and data partitions for an ephemeral device.
///
/// With a requested swap size the data partition gets the remainder; a
/// requested size of zero yields a single data partition. Without a request
/// the swap partition is sized by [`default_swap_size`]; when that caps at
/// half the device the data partition is also exactly half (integer
/// division, an odd trailing byte stays unallocated).
///
/// Returns `None` when the requested swap does not fit on the device.
pub fn ephemeral_partition_plan(
    device_size: u64,
    desired_swap: Option<u64>,
    total_memory: u64,
) -> Option<PartitionPlan> {
    match desired_swap {
        Some(0) => Some(vec![Partition::linux(device_size)]),
        Some(swap) => {
            let linux = device_size.checked_sub(swap)?;
            Some(vec![Partition::swap(swap), Partition::linux(linux)])
        }
        None => {
            let swap = default_swap_size(total_memory, device_size);
            let linux = if device_size > total_memory.saturating_mul(2) {
                device_size - swap
            } else {
                device_size / 2
            };
            Some(vec![Partition::swap(swap), Partition::linux(linux)])
        }
    }
}

/// Total bytes a plan allocates.
pub fn plan_size(plan: &[Partition]) -> u64 {
    plan.iter().map(|p| p.size_in_bytes).sum()
}
