//! Disk layout management.
//!
//! Prepares the node's block storage:
//! - ephemeral disk partitioning, formatting and mounting (or carving space
//!   from the root disk when there is no ephemeral disk)
//! - root partition and filesystem growth
//! - raw ephemeral disk labeling
//! - persistent disk mount, unmount, mountability checks and migration
//! - system directories on the data disk (`sys`, temp, logs, blobs) and
//!   hardened system mounts
//!
//! Tools are driven through the collaborator traits below so every operation
//! can be exercised against mocks.

mod device;
mod dirs;
mod error;
mod formatter;
mod layout;
mod manager;
mod mounter;
mod partition;
mod partitioner;
mod persistent;
mod resolver;
mod settings;

pub use device::{partition_path, split_partition_path, whole_disk_path, DeviceClass};
pub use error::DiskError;
pub use formatter::{FileSystemType, Formatter, LinuxFormatter, MockFormatter};
pub use layout::MIN_ROOT_EPHEMERAL_SPACE;
pub use manager::{DiskCollaborators, DiskManager};
pub use mounter::{
    LinuxMounter, MockMounter, MockMountsSearcher, Mount, MountCall, Mounter, MountsSearcher,
    ProcMountsSearcher,
};
pub use partition::{
    default_swap_size, ephemeral_partition_plan, plan_size, Partition, PartitionPlan,
    PartitionType,
};
pub use partitioner::{
    MockPartitioner, PartedPartitioner, Partitioner, Partitioners, RootDevicePartitioner,
    SfdiskPartitioner,
};
pub use resolver::{DevDirResolver, DevicePathResolver, MockResolver, ResolveError};
pub use settings::{DevicePathResolutionType, DiskSettings, UnknownResolutionType};
