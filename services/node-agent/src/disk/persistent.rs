//! Persistent disk mount, unmount, and migration.
//!
//! A persistent disk holds one `linux` partition (or, with preformatted
//! disks, a filesystem on the whole device) mounted at the store directory.
//! When a different disk is already mounted there, the new disk goes to the
//! migration target instead and [`DiskManager::migrate_persistent_disk`]
//! later moves the data across.

use std::path::Path;

use tracing::{debug, info, warn};

use super::device::{partition_path, whole_disk_path};
use super::error::DiskError;
use super::formatter::FileSystemType;
use super::manager::{create_dir, replace_symlink, DiskManager};
use super::partition::Partition;
use super::settings::{DevicePathResolutionType, DiskSettings};
use crate::system::CmdError;

const NO_PARTITION_TABLE: &str = "does not contain a recognized partition table";

impl DiskManager {
    /// Partition or device that holds the persistent filesystem.
    fn persistent_partition_path(&self, device: &str) -> String {
        if self.options.use_preformatted_persistent_disk {
            device.to_string()
        } else {
            partition_path(device, 1)
        }
    }

    /// Mount a persistent disk at the store directory.
    ///
    /// Mounting the disk that is already there is a no-op. A different disk
    /// is mounted at the migration target instead.
    pub async fn mount_persistent_disk(&self, settings: &DiskSettings) -> Result<(), DiskError> {
        let device = self.resolver.resolve(settings).await?;
        let partition = self.persistent_partition_path(&device);
        let store_dir = self.paths.store_dir();

        let mounted = self
            .mounter
            .is_mount_point(&store_dir)
            .await
            .map_err(|e| DiskError::mount("Checking whether store dir is a mount point", e))?;

        let mount_point = match mounted {
            Some(current) if current == partition => {
                info!(disk = %settings.display_name(), partition = %partition, "Persistent disk already mounted");
                return Ok(());
            }
            Some(current) => {
                let target = self.paths.store_migration_dir();
                info!(
                    disk = %settings.display_name(),
                    current = %current,
                    partition = %partition,
                    target = %target.display(),
                    "Store dir holds another disk, mounting at migration target"
                );
                target
            }
            None => store_dir,
        };

        create_dir(&mount_point, 0o700).await.map_err(|e| {
            DiskError::io(format!("Creating mount point '{}'", mount_point.display()), e)
        })?;

        if !self.options.use_preformatted_persistent_disk {
            let fs = FileSystemType::for_persistent_disk(settings.filesystem_type.as_deref())?;
            let partitioner = self.partitioners.select(settings.partitioner.as_deref())?;

            partitioner
                .partition(&device, &[Partition::linux(0)])
                .await
                .map_err(|e| DiskError::partition(format!("Partitioning disk '{}'", device), e))?;

            self.formatter
                .format(&partition, fs)
                .await
                .map_err(|e| DiskError::format(format!("Formatting partition with {}", fs), e))?;
        }

        self.mounter
            .mount(&partition, &mount_point, &settings.mount_options)
            .await
            .map_err(|e| {
                DiskError::mount(
                    format!("Mounting partition '{}' at '{}'", partition, mount_point.display()),
                    e,
                )
            })?;

        self.state
            .write_managed_disk_id(&settings.id)
            .await
            .map_err(|source| DiskError::State {
                stage: "Writing managed_disk_settings.json".to_string(),
                source,
            })?;

        info!(disk = %settings.display_name(), partition = %partition, mount_point = %mount_point.display(), "Mounted persistent disk");
        Ok(())
    }

    /// Unmount a persistent disk.
    ///
    /// Returns `false` when it was not mounted, including when the disk can
    /// no longer be found.
    pub async fn unmount_persistent_disk(&self, settings: &DiskSettings) -> Result<bool, DiskError> {
        let device = match self.resolver.resolve(settings).await {
            Ok(device) => device,
            Err(e) if e.is_timeout() => {
                debug!(disk = %settings.display_name(), "Disk not found, treating as unmounted");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let partition = self.persistent_partition_path(&device);
        self.mounter
            .unmount(&partition)
            .await
            .map_err(|e| DiskError::unmount(format!("Unmounting partition '{}'", partition), e))
    }

    /// Whether a persistent disk is currently mounted.
    pub async fn is_persistent_disk_mounted(&self, settings: &DiskSettings) -> Result<bool, DiskError> {
        let device = match self.resolver.resolve(settings).await {
            Ok(device) => device,
            Err(e) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let partition = self.persistent_partition_path(&device);
        self.mounter.is_mounted(&partition).await.map_err(|e| {
            DiskError::mount(format!("Checking whether '{}' is mounted", partition), e)
        })
    }

    /// Whether a persistent disk already carries a partition to mount.
    pub async fn is_persistent_disk_mountable(&self, settings: &DiskSettings) -> Result<bool, DiskError> {
        let device = match self.resolver.resolve(settings).await {
            Ok(device) => device,
            Err(e) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let stage = || format!("Determining whether disk '{}' is mountable", device);
        let dump = match self.runner.run_command("sfdisk", &["-d", &device]).await {
            Ok(out) => out.stdout,
            Err(CmdError::Failed { output, .. })
                if output.stderr.contains(NO_PARTITION_TABLE)
                    || output.stdout.contains(NO_PARTITION_TABLE) =>
            {
                return Ok(false)
            }
            Err(e) => return Err(DiskError::command(stage(), e)),
        };

        Ok(has_sized_partition(&dump))
    }

    /// Move a persistent disk's data from `from` to `to` and mount the new
    /// disk in place of the old one.
    pub async fn migrate_persistent_disk(&self, from: &Path, to: &Path) -> Result<(), DiskError> {
        let multipath =
            self.options.device_path_resolution_type == DevicePathResolutionType::Multipath;

        let source_partition = if multipath {
            self.mounter
                .is_mount_point(from)
                .await
                .map_err(|e| DiskError::mount("Finding partition of old persistent disk", e))?
        } else {
            None
        };

        info!(from = %from.display(), to = %to.display(), "Migrating persistent disk");

        self.mounter
            .remount_as_readonly(from)
            .await
            .map_err(|e| DiskError::mount("Remounting persistent disk as readonly", e))?;

        let copy = format!(
            "(tar -C {} -cf - .) | (tar -C {} -xpf -)",
            from.display(),
            to.display()
        );
        self.runner
            .run_command("sh", &["-c", &copy])
            .await
            .map_err(|e| DiskError::command("Copying files from old disk to new disk", e))?;

        let from_str = from.to_string_lossy();
        self.mounter
            .unmount(&from_str)
            .await
            .map_err(|e| DiskError::unmount("Unmounting old persistent disk", e))?;

        self.mounter
            .remount(to, from, &[])
            .await
            .map_err(|e| DiskError::mount("Remounting new disk on original mountpoint", e))?;

        if let Some(partition) = source_partition {
            self.flush_multipath(&partition).await?;
        }

        Ok(())
    }

    /// Release the multipath map backing a vacated partition.
    async fn flush_multipath(&self, partition: &str) -> Result<(), DiskError> {
        let disk = whole_disk_path(partition);
        let name = disk.rsplit('/').next().unwrap_or(&disk).to_string();

        let out = self
            .runner
            .run_command("multipath", &["-ll"])
            .await
            .map_err(|e| DiskError::command("Listing multipath devices", e))?;

        match find_multipath_alias(&out.stdout, &name) {
            Some(alias) => {
                info!(alias = %alias, "Flushing multipath map of old persistent disk");
                self.runner
                    .run_command("multipath", &["-f", &alias])
                    .await
                    .map_err(|e| {
                        DiskError::command(format!("Flushing multipath device '{}'", alias), e)
                    })?;
            }
            None => warn!(partition = %partition, "No multipath map found for old persistent disk"),
        }
        Ok(())
    }

    /// Link `<instance disks dir>/<name>` to the disk's device.
    pub async fn associate_disk(&self, name: &str, settings: &DiskSettings) -> Result<(), DiskError> {
        let device = self.resolver.resolve(settings).await?;
        let dir = self.paths.instance_disks_dir();
        let stage = || format!("Associating disk '{}' with name '{}'", settings.display_name(), name);

        create_dir(&dir, 0o750)
            .await
            .map_err(|e| DiskError::io(stage(), e))?;

        let link = dir.join(name);
        replace_symlink(Path::new(&device), &link)
            .await
            .map_err(|e| DiskError::io(stage(), e))?;

        info!(name = %name, device = %device, "Associated disk");
        Ok(())
    }

    /// Real device path of the ephemeral disk, if it can be found.
    pub async fn ephemeral_disk_path(&self, settings: &DiskSettings) -> Option<String> {
        if settings.path.is_empty() && settings.id.is_empty() {
            return None;
        }
        match self.resolver.resolve(settings).await {
            Ok(device) => Some(device),
            Err(e) => {
                warn!(error = %e, "Ephemeral disk not found");
                None
            }
        }
    }

    /// Id of the disk recorded as mounted at the store directory.
    pub async fn managed_disk_id(&self) -> Result<Option<String>, DiskError> {
        self.state
            .managed_disk_id()
            .await
            .map_err(|source| DiskError::State {
                stage: "Reading managed_disk_settings.json".to_string(),
                source,
            })
    }
}

/// Whether `sfdisk -d` output lists a partition with a non-zero size.
fn has_sized_partition(dump: &str) -> bool {
    dump.lines()
        .filter(|line| line.contains(" : ") && line.contains("start="))
        .any(|line| {
            line.split(',')
                .filter_map(|field| field.trim().strip_prefix("size="))
                .any(|size| size.trim().parse::<u64>().is_ok_and(|s| s > 0))
        })
}

/// Alias of the multipath map named `name` in `multipath -ll` output.
///
/// Map header lines carry the alias first and the dm node (`dm-N`) later on
/// the same line.
fn find_multipath_alias(listing: &str, name: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        let alias = tokens.next()?;
        let is_header = tokens.any(|t| t.starts_with("dm-"));
        (is_header && alias == name).then(|| alias.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SFDISK_PARTITIONED: &str = "label: dos
label-id: 0x5a3c1a2b
device: /dev/sdb
unit: sectors

/dev/sdb1 : start=        2048, size=    20969472, type=83
";

    const SFDISK_EMPTY_ENTRY: &str = "# partition table of /dev/sdb
unit: sectors

/dev/sdb1 : start=        0, size=        0, Id= 0
";

    const MULTIPATH_LL: &str = "mpatha (3600a098038303053453f463045727a41) dm-0 NETAPP,LUN C-Mode
size=10G features='3 queue_if_no_path pg_init_retries 50' hwhandler='1 alua' wp=rw
|-+- policy='service-time 0' prio=50 status=active
| `- 3:0:0:0 sdc 8:32 active ready running
mpathb (3600a098038303053453f463045727a42) dm-3 NETAPP,LUN C-Mode
size=20G features='3 queue_if_no_path pg_init_retries 50' hwhandler='1 alua' wp=rw
";

    #[test]
    fn test_has_sized_partition() {
        assert!(has_sized_partition(SFDISK_PARTITIONED));
        assert!(has_sized_partition(
            "/dev/sdb1 : start=       63, size=  5997984, Id=83\n"
        ));
        assert!(!has_sized_partition(SFDISK_EMPTY_ENTRY));
        assert!(!has_sized_partition(""));
    }

    #[test]
    fn test_find_multipath_alias() {
        assert_eq!(
            find_multipath_alias(MULTIPATH_LL, "mpathb"),
            Some("mpathb".to_string())
        );
        assert_eq!(find_multipath_alias(MULTIPATH_LL, "mpathz"), None);
        assert_eq!(find_multipath_alias(MULTIPATH_LL, "size=10G"), None);
    }
}
