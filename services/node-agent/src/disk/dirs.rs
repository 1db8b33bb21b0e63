//! System directories placed on ephemeral storage.
//!
//! Once the data directory is mounted, job logs, temp space, blobs and the
//! system log directory are moved onto it and the shared system mounts are
//! hardened with `nodev`/`noexec`/`nosuid`.

use std::path::Path;

use tracing::{debug, info};

use super::error::DiskError;
use super::manager::{create_dir, replace_symlink, DiskManager};

const VCAP_OWNER: &str = "root:vcap";

const SYSTEM_TMP_DIRS: [&str; 2] = ["/tmp", "/var/tmp"];
const SYSTEM_LOG_DIR: &str = "/var/log";
const HOME_DIR: &str = "/home";
const SHARED_MEMORY_DIRS: [&str; 2] = ["/dev/shm", "/run/shm"];

const CHRONY_USER: &str = "_chrony";

fn options(opts: &[&str]) -> Vec<String> {
    opts.iter().map(|o| o.to_string()).collect()
}

impl DiskManager {
    async fn run(&self, stage: &str, name: &str, args: &[&str]) -> Result<(), DiskError> {
        self.runner
            .run_command(name, args)
            .await
            .map(|_| ())
            .map_err(|e| DiskError::command(stage, e))
    }

    async fn chown(&self, owner: &str, path: &Path) -> Result<(), DiskError> {
        let path = path.to_string_lossy();
        self.run(&format!("Chowning '{}'", path), "chown", &[owner, &path])
            .await
    }

    async fn chmod(&self, mode: &str, path: &Path) -> Result<(), DiskError> {
        let path = path.to_string_lossy();
        self.run(&format!("Chmoding '{}'", path), "chmod", &[mode, &path])
            .await
    }

    async fn make_dir(&self, path: &Path, mode: u32) -> Result<(), DiskError> {
        create_dir(path, mode)
            .await
            .map_err(|e| DiskError::io(format!("Creating directory '{}'", path.display()), e))
    }

    /// Lay out the data directory: `sys/log`, `sys/run` on a small tmpfs,
    /// `jobs` and `packages`, and the `<base>/sys` link.
    pub async fn setup_data_dir(&self) -> Result<(), DiskError> {
        let sys_dir = self.paths.data_sys_dir();
        let log_dir = sys_dir.join("log");

        self.make_dir(&log_dir, 0o750).await?;
        self.chown(VCAP_OWNER, &sys_dir).await?;
        self.chown(VCAP_OWNER, &log_dir).await?;

        let link = self.paths.sys_dir();
        replace_symlink(&sys_dir, &link).await.map_err(|e| {
            DiskError::io(format!("Symlinking '{}' to '{}'", link.display(), sys_dir.display()), e)
        })?;

        for (name, mode) in [("jobs", 0o750), ("packages", 0o755)] {
            let dir = self.paths.data_dir().join(name);
            self.make_dir(&dir, mode).await?;
            self.chown(VCAP_OWNER, &dir).await?;
        }

        let run_dir = sys_dir.join("run");
        let mounted = self
            .mounter
            .is_mount_point(&run_dir)
            .await
            .map_err(|e| DiskError::mount("Checking whether sys/run is a mount point", e))?;
        match mounted {
            Some(_) => debug!(path = %run_dir.display(), "sys/run already mounted"),
            None => {
                self.make_dir(&run_dir, 0o750).await?;
                self.chown(VCAP_OWNER, &run_dir).await?;
                self.mounter
                    .mount_filesystem("tmpfs", &run_dir, "tmpfs", &options(&["size=1m"]))
                    .await
                    .map_err(|e| DiskError::mount("Mounting tmpfs to sys/run", e))?;
            }
        }

        info!(data_dir = %self.paths.data_dir().display(), "Data directory ready");
        Ok(())
    }

    /// Restrict the system temp directories and, unless the defaults are
    /// kept, back them with `root_tmp` on the data directory.
    pub async fn setup_tmp_dir(&self) -> Result<(), DiskError> {
        for dir in SYSTEM_TMP_DIRS {
            self.chown(VCAP_OWNER, Path::new(dir)).await?;
            self.chmod("1770", Path::new(dir)).await?;
        }

        self.make_dir(&self.paths.tmp_dir(), 0o755).await?;

        if self.options.use_default_tmp_dir {
            return Ok(());
        }

        let root_tmp = self.paths.root_tmp_dir();
        let root_tmp_str = root_tmp.to_string_lossy();
        self.run("Creating root_tmp dir", "mkdir", &["-p", &root_tmp_str])
            .await?;
        self.chmod("1770", &root_tmp).await?;

        for dir in SYSTEM_TMP_DIRS {
            let mounted = self
                .mounter
                .is_mounted(dir)
                .await
                .map_err(|e| DiskError::mount(format!("Checking whether {} is mounted", dir), e))?;

            if !mounted {
                self.mounter
                    .mount_filesystem(&root_tmp_str, Path::new(dir), "", &options(&["bind"]))
                    .await
                    .map_err(|e| DiskError::mount(format!("Bind mounting root_tmp to {}", dir), e))?;
                self.chown(VCAP_OWNER, Path::new(dir)).await?;
            }

            self.mounter
                .remount_in_place(Path::new(dir), &options(&["nodev", "noexec", "nosuid"]))
                .await
                .map_err(|e| DiskError::mount(format!("Remounting {}", dir), e))?;
        }

        info!(root_tmp = %root_tmp.display(), "Temp directories ready");
        Ok(())
    }

    /// Build `root_log` on the data directory and bind mount it over
    /// `/var/log`.
    pub async fn setup_log_dir(&self) -> Result<(), DiskError> {
        let root_log = self.paths.root_log_dir();
        self.make_dir(&root_log, 0o771).await?;
        self.chmod("0771", &root_log).await?;

        for (name, mode) in [("audit", "0750"), ("sysstat", "0755")] {
            let dir = root_log.join(name);
            self.run(
                &format!("Creating {} log dir", name),
                "mkdir",
                &["-p", &dir.to_string_lossy()],
            )
            .await?;
            self.chmod(mode, &dir).await?;
        }

        self.chown("root:syslog", &root_log).await?;

        for (name, mode) in [("btmp", "0600"), ("wtmp", "0664")] {
            let file = root_log.join(name);
            self.run(
                &format!("Touching {}", name),
                "touch",
                &[&file.to_string_lossy()],
            )
            .await?;
            self.chown("root:utmp", &file).await?;
            self.chmod(mode, &file).await?;
        }

        if self.has_system_user(CHRONY_USER).await {
            let chrony = root_log.join("chrony");
            self.run(
                "Creating chrony log dir",
                "mkdir",
                &["-p", &chrony.to_string_lossy()],
            )
            .await?;
            self.chmod("0700", &chrony).await?;
            self.chown("_chrony:_chrony", &chrony).await?;
        }

        let mounted = self
            .mounter
            .is_mounted(SYSTEM_LOG_DIR)
            .await
            .map_err(|e| DiskError::mount("Checking whether /var/log is mounted", e))?;
        if mounted {
            debug!("/var/log already mounted");
            return Ok(());
        }

        self.mounter
            .mount_filesystem(
                &root_log.to_string_lossy(),
                Path::new(SYSTEM_LOG_DIR),
                "",
                &options(&["bind"]),
            )
            .await
            .map_err(|e| DiskError::mount("Bind mounting root_log to /var/log", e))?;

        info!(root_log = %root_log.display(), "Log directory ready");
        Ok(())
    }

    /// Whether `/etc/passwd` lists `user`. An unreadable file lists nobody.
    async fn has_system_user(&self, user: &str) -> bool {
        match tokio::fs::read_to_string(&self.passwd_path).await {
            Ok(passwd) => passwd
                .lines()
                .any(|line| line.split(':').next() == Some(user)),
            Err(e) => {
                debug!(path = %self.passwd_path.display(), error = %e, "Reading passwd");
                false
            }
        }
    }

    /// Create the blobstore cache directory.
    pub async fn setup_blobs_dir(&self) -> Result<(), DiskError> {
        let blobs = self.paths.blobs_dir();
        self.make_dir(&blobs, 0o700).await?;
        self.chown(VCAP_OWNER, &blobs).await
    }

    /// Bind mount `/home` onto itself with `nodev`.
    pub async fn setup_home_dir(&self) -> Result<(), DiskError> {
        let mounted = self
            .mounter
            .is_mounted(HOME_DIR)
            .await
            .map_err(|e| DiskError::mount("Checking whether /home is mounted", e))?;
        if mounted {
            return Ok(());
        }

        let home = Path::new(HOME_DIR);
        self.mounter
            .mount_filesystem(HOME_DIR, home, "", &options(&["bind"]))
            .await
            .map_err(|e| DiskError::mount("Bind mounting /home", e))?;
        self.mounter
            .remount_in_place(home, &options(&["nodev"]))
            .await
            .map_err(|e| DiskError::mount("Remounting /home", e))
    }

    /// Remount the shared memory filesystems with `noexec,nodev,nosuid`.
    pub async fn setup_shared_memory(&self) -> Result<(), DiskError> {
        for dir in SHARED_MEMORY_DIRS {
            let path = Path::new(dir);
            let mounted = self
                .mounter
                .is_mount_point(path)
                .await
                .map_err(|e| DiskError::mount(format!("Checking whether {} is a mount point", dir), e))?;
            if mounted.is_none() {
                continue;
            }

            self.mounter
                .remount_in_place(path, &options(&["noexec", "nodev", "nosuid"]))
                .await
                .map_err(|e| DiskError::mount(format!("Remounting {}", dir), e))?;
        }
        Ok(())
    }
}
