//! Configuration for the node agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::disk::{DevicePathResolutionType, DiskSettings};
use crate::supervisor::ReloadOptions;

/// Fixed on-disk locations, all derived from the agent base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    base_dir: PathBuf,
}

impl AgentPaths {
    /// Create paths rooted at the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ephemeral data mount point.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Canonical persistent disk mount point.
    pub fn store_dir(&self) -> PathBuf {
        self.base_dir.join("store")
    }

    /// Where a replacement persistent disk is mounted before migration.
    pub fn store_migration_dir(&self) -> PathBuf {
        self.base_dir.join("store_migration_target")
    }

    /// Link to the system area of the data directory.
    pub fn sys_dir(&self) -> PathBuf {
        self.base_dir.join("sys")
    }

    /// Job logs and runtime files, kept on ephemeral storage.
    pub fn data_sys_dir(&self) -> PathBuf {
        self.data_dir().join("sys")
    }

    /// Backing directory bind mounted over `/tmp` and `/var/tmp`.
    pub fn root_tmp_dir(&self) -> PathBuf {
        self.data_dir().join("root_tmp")
    }

    /// Backing directory bind mounted over `/var/log`.
    pub fn root_log_dir(&self) -> PathBuf {
        self.data_dir().join("root_log")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir().join("blobs")
    }

    /// monit HTTP interface credentials (`user:password`).
    pub fn monit_user_path(&self) -> PathBuf {
        self.base_dir.join("monit").join("monit.user")
    }

    /// Agent state directory.
    pub fn bosh_dir(&self) -> PathBuf {
        self.base_dir.join("bosh")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.bosh_dir().join("etc")
    }

    /// Per-job monit configuration fragments.
    pub fn monit_jobs_dir(&self) -> PathBuf {
        self.base_dir.join("monit").join("job")
    }

    /// Named symlinks to associated disks.
    pub fn instance_disks_dir(&self) -> PathBuf {
        self.base_dir.join("instance").join("disks")
    }

    /// Identity of the disk mounted at the store directory.
    pub fn managed_disk_settings_path(&self) -> PathBuf {
        self.bosh_dir().join("managed_disk_settings.json")
    }

    /// Version of the stemcell the node booted from.
    pub fn stemcell_version_path(&self) -> PathBuf {
        self.etc_dir().join("stemcell_version")
    }

    /// Stemcell version the ephemeral data area was last prepared for.
    pub fn agent_version_path(&self) -> PathBuf {
        self.data_dir().join(".bosh").join("agent_version")
    }

    /// Default temp directory for child processes.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }
}

/// Options controlling disk preparation.
#[derive(Debug, Clone, Default)]
pub struct DiskOptions {
    /// Skip all partitioning, formatting and mounting.
    pub skip_disk_setup: bool,

    /// Carve ephemeral partitions out of the root disk when no ephemeral disk exists.
    pub create_partition_if_no_ephemeral_disk: bool,

    /// Wipe the ephemeral data area when the stemcell version changes.
    pub scrub_ephemeral_disk: bool,

    /// Keep the system `/tmp` and `/var/tmp` instead of bind mounting the
    /// data directory's `root_tmp` over them.
    pub use_default_tmp_dir: bool,

    /// Persistent disks arrive formatted; mount the whole device.
    pub use_preformatted_persistent_disk: bool,

    /// How disk settings are turned into device paths.
    pub device_path_resolution_type: DevicePathResolutionType,
}

/// Monit connection settings.
#[derive(Debug, Clone)]
pub struct MonitConfig {
    /// Monit HTTP interface URL.
    pub url: String,

    /// File holding `user:password` for the HTTP interface.
    pub credentials_path: PathBuf,

    /// Service group managed by the agent.
    pub group: String,

    /// Loopback port for failure alert mail.
    pub job_failures_port: u16,

    /// Reload convergence options.
    pub reload: ReloadOptions,
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed agent paths.
    pub paths: AgentPaths,

    /// Temp directory exported to child processes.
    pub tmp_dir: PathBuf,

    /// Disk preparation options.
    pub disk: DiskOptions,

    /// Ephemeral disk to prepare, if the node has one.
    pub ephemeral_disk: Option<DiskSettings>,

    /// Explicit swap size in bytes.
    pub swap_size_bytes: Option<u64>,

    /// Raw ephemeral disks to label.
    pub raw_ephemeral_disks: Vec<DiskSettings>,

    /// Monit settings.
    pub monit: MonitConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_dir = env_or("BEDROCK_BASE_DIR", "/var/vcap");
        let paths = AgentPaths::new(&base_dir);

        let tmp_dir = std::env::var("BEDROCK_TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths.tmp_dir());

        let device_path_resolution_type = env_or("BEDROCK_DEVICE_PATH_RESOLUTION", "identity")
            .parse()
            .context("parsing BEDROCK_DEVICE_PATH_RESOLUTION")?;

        let disk = DiskOptions {
            skip_disk_setup: env_flag("BEDROCK_SKIP_DISK_SETUP")?,
            create_partition_if_no_ephemeral_disk: env_flag(
                "BEDROCK_CREATE_PARTITION_IF_NO_EPHEMERAL_DISK",
            )?,
            scrub_ephemeral_disk: env_flag("BEDROCK_SCRUB_EPHEMERAL_DISK")?,
            use_default_tmp_dir: env_flag("BEDROCK_USE_DEFAULT_TMP_DIR")?,
            use_preformatted_persistent_disk: env_flag(
                "BEDROCK_USE_PREFORMATTED_PERSISTENT_DISK",
            )?,
            device_path_resolution_type,
        };

        let ephemeral_disk = std::env::var("BEDROCK_EPHEMERAL_DISK")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|path| DiskSettings::with_path(&path));

        let swap_size_bytes = std::env::var("BEDROCK_SWAP_SIZE_BYTES")
            .ok()
            .map(|s| s.parse::<u64>())
            .transpose()
            .context("parsing BEDROCK_SWAP_SIZE_BYTES")?;

        let raw_ephemeral_disks = std::env::var("BEDROCK_RAW_EPHEMERAL_DISKS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(DiskSettings::with_path)
                    .collect()
            })
            .unwrap_or_default();

        let defaults = ReloadOptions::default();
        let reload = ReloadOptions {
            max_tries: env_parse("BEDROCK_MONIT_RELOAD_MAX_TRIES", defaults.max_tries)?,
            max_check_tries: env_parse(
                "BEDROCK_MONIT_RELOAD_MAX_CHECK_TRIES",
                defaults.max_check_tries,
            )?,
            delay_between_check_tries: Duration::from_millis(env_parse(
                "BEDROCK_MONIT_RELOAD_CHECK_DELAY_MS",
                defaults.delay_between_check_tries.as_millis() as u64,
            )?),
        };

        let monit = MonitConfig {
            url: env_or("BEDROCK_MONIT_URL", "http://127.0.0.1:2822"),
            credentials_path: std::env::var("BEDROCK_MONIT_CREDENTIALS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| paths.monit_user_path()),
            group: env_or("BEDROCK_MONIT_GROUP", "vcap"),
            job_failures_port: env_parse("BEDROCK_JOB_FAILURES_PORT", 2825)?,
            reload,
        };

        let log_level = env_or("BEDROCK_LOG_LEVEL", "info");

        Ok(Self {
            paths,
            tmp_dir,
            disk,
            ephemeral_disk,
            swap_size_bytes,
            raw_ephemeral_disks,
            monit,
            log_level,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> Result<bool> {
    match std::env::var(key) {
        Ok(value) => parse_flag(&value).with_context(|| format!("parsing {}", key)),
        Err(_) => Ok(false),
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("parsing {}", key)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => anyhow::bail!("invalid boolean '{}'", other),
    }
}
