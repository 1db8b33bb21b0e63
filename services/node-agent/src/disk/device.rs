//! Device classification and partition naming.
//!
//! Every partition path in the agent is derived here from a whole-disk path:
//!
//! | class   | prefix         | partition N      |
//! |---------|----------------|------------------|
//! | nvme    | `/dev/nvme`    | `{path}p{N}`     |
//! | mapper  | `/dev/mapper/` | `{path}-part{N}` |
//! | generic | anything else  | `{path}{N}`      |
//!
//! Classification is a pure function of the path string and is recomputed on
//! every call.

/// Naming family of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Generic,
    Nvme,
    Mapper,
}

impl DeviceClass {
    /// Classify a whole-disk or partition path.
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/dev/nvme") {
            Self::Nvme
        } else if path.starts_with("/dev/mapper/") {
            Self::Mapper
        } else {
            Self::Generic
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::Generic => "",
            Self::Nvme => "p",
            Self::Mapper => "-part",
        }
    }
}

/// Path of partition `index` on the whole disk at `device`.
pub fn partition_path(device: &str, index: u32) -> String {
    let class = DeviceClass::classify(device);
    format!("{}{}{}", device, class.separator(), index)
}

/// Split a partition path into its whole-disk path and partition index.
///
/// Returns `None` when the path carries no partition suffix for its class.
pub fn split_partition_path(partition: &str) -> Option<(String, u32)> {
    let class = DeviceClass::classify(partition);

    let digits_start = partition
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if digits_start == partition.len() {
        return None;
    }

    let index: u32 = partition[digits_start..].parse().ok()?;
    let head = &partition[..digits_start];
    let disk = head.strip_suffix(class.separator())?;

    if disk.is_empty() || disk == "/dev/" {
        return None;
    }

    Some((disk.to_string(), index))
}

/// Whole-disk path for a partition path, or the input when it has no suffix.
pub fn whole_disk_path(partition: &str) -> String {
    split_partition_path(partition)
        .map(|(disk, _)| disk)
        .unwrap_or_else(|| partition.to_string())
}
