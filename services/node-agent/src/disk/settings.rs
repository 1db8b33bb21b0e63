//! Disk identity passed into disk operations.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity and preferences of one disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSettings {
    /// Opaque disk id declared by the orchestrator.
    pub id: String,

    /// Device path hint.
    pub path: String,

    /// Requested filesystem (`ext4` when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_type: Option<String>,

    /// Extra mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,

    /// Named partitioner to use instead of the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioner: Option<String>,
}

impl DiskSettings {
    /// Settings for a disk with an id and path hint.
    pub fn new(id: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Settings known only by device path.
    pub fn with_path(path: &str) -> Self {
        Self::new("", path)
    }

    pub fn with_filesystem(mut self, filesystem_type: &str) -> Self {
        self.filesystem_type = Some(filesystem_type.to_string());
        self
    }

    pub fn with_mount_options(mut self, options: &[&str]) -> Self {
        self.mount_options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_partitioner(mut self, partitioner: &str) -> Self {
        self.partitioner = Some(partitioner.to_string());
        self
    }

    /// Name used in logs and errors: the id, or the path when there is none.
    pub fn display_name(&self) -> &str {
        if self.id.is_empty() {
            &self.path
        } else {
            &self.id
        }
    }
}

/// How disk settings are turned into device paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePathResolutionType {
    /// Use the path hint as is.
    #[default]
    Identity,
    /// Look the id up under `/dev/disk/by-id`.
    ById,
    /// Look the id up as a multipath map under `/dev/mapper`.
    Multipath,
}

/// Unrecognized resolution type name.
#[derive(Debug, Error)]
#[error("unknown device path resolution type '{0}'")]
pub struct UnknownResolutionType(String);

impl FromStr for DevicePathResolutionType {
    type Err = UnknownResolutionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" | "" => Ok(Self::Identity),
            "by-id" => Ok(Self::ById),
            "multipath" | "iscsi" => Ok(Self::Multipath),
            other => Err(UnknownResolutionType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_type_from_str() {
        assert_eq!(
            "identity".parse::<DevicePathResolutionType>().unwrap(),
            DevicePathResolutionType::Identity
        );
        assert_eq!(
            "by-id".parse::<DevicePathResolutionType>().unwrap(),
            DevicePathResolutionType::ById
        );
        assert_eq!(
            "iscsi".parse::<DevicePathResolutionType>().unwrap(),
            DevicePathResolutionType::Multipath
        );
        assert!("virtio-bogus".parse::<DevicePathResolutionType>().is_err());
    }

    #[test]
    fn test_settings_serde_defaults() {
        let settings: DiskSettings =
            serde_json::from_str(r#"{"id":"vol-1","path":"/dev/sdc"}"#).unwrap();
        assert_eq!(settings, DiskSettings::new("vol-1", "/dev/sdc"));
        assert_eq!(settings.display_name(), "vol-1");
        assert_eq!(DiskSettings::with_path("/dev/sdc").display_name(), "/dev/sdc");
    }
}
