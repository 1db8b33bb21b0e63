//! Job supervisor backed by monit.
//!
//! Jobs are registered by copying their monit configuration into the monit
//! jobs directory and reloading monit. Every job service belongs to one
//! service group, which is the unit start, stop and status act on.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{MonitError, SupervisorError};
use super::monit::{MonitClient, MonitCredentials};
use crate::system::{poll_until, Clock, CmdError, CmdRunner, Poll, PollError, PollOptions};

/// How long stop waits for the group to wind down.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Interval between status checks while stopping.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts at starting the monit runit service.
pub const START_MONIT_ATTEMPTS: usize = 10;

/// Delay between attempts at starting monit.
pub const START_MONIT_INTERVAL: Duration = Duration::from_secs(1);

/// Bounds for waiting on a monit reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOptions {
    /// Number of `monit reload` invocations.
    pub max_tries: usize,
    /// Incarnation checks after each invocation.
    pub max_check_tries: usize,
    pub delay_between_check_tries: Duration,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            max_tries: 3,
            max_check_tries: 6,
            delay_between_check_tries: Duration::from_secs(5),
        }
    }
}

/// Aggregate state of the job services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Failing,
    Starting,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Failing => "failing",
            JobStatus::Starting => "starting",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives monit for the jobs on this node.
pub struct JobSupervisor {
    runner: Arc<dyn CmdRunner>,
    client: Arc<dyn MonitClient>,
    clock: Arc<dyn Clock>,
    jobs_dir: PathBuf,
    group: String,
    reload: ReloadOptions,
    service_dir: PathBuf,
    sv_dir: PathBuf,
}

impl JobSupervisor {
    pub fn new(
        runner: Arc<dyn CmdRunner>,
        client: Arc<dyn MonitClient>,
        clock: Arc<dyn Clock>,
        jobs_dir: impl Into<PathBuf>,
        group: &str,
    ) -> Self {
        Self {
            runner,
            client,
            clock,
            jobs_dir: jobs_dir.into(),
            group: group.to_string(),
            reload: ReloadOptions::default(),
            service_dir: PathBuf::from("/etc/service"),
            sv_dir: PathBuf::from("/etc/sv"),
        }
    }

    /// Use other runit directories than `/etc/service` and `/etc/sv`.
    pub fn with_runit_dirs(mut self, service_dir: impl Into<PathBuf>, sv_dir: impl Into<PathBuf>) -> Self {
        self.service_dir = service_dir.into();
        self.sv_dir = sv_dir.into();
        self
    }

    pub fn with_reload_options(mut self, reload: ReloadOptions) -> Self {
        self.reload = reload;
        self
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    async fn incarnation(&self) -> Result<i64, SupervisorError> {
        self.client
            .status()
            .await
            .map(|s| s.incarnation)
            .map_err(|e| SupervisorError::monit("Getting monit incarnation", e))
    }

    /// Ask monit to reload and wait until its incarnation changes.
    ///
    /// `monit reload` failures are only logged: monit often exits non-zero
    /// while still reloading.
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        let before = self.incarnation().await?;
        let after = AtomicI64::new(before);

        for attempt in 1..=self.reload.max_tries {
            info!(attempt, incarnation = before, "Reloading monit");
            if let Err(e) = self.runner.run_command("monit", &["reload"]).await {
                warn!(error = %e, attempt, "monit reload command failed");
            }

            let options = PollOptions::attempts(
                self.reload.max_check_tries,
                self.reload.delay_between_check_tries,
            );
            let after_ref = &after;
            let result = poll_until(self.clock.as_ref(), options, move || async move {
                let current = self.incarnation().await?;
                after_ref.store(current, Ordering::SeqCst);
                if current != before {
                    return Ok(Poll::Ready(()));
                }
                debug!(before, after = current, "Waiting for monit to reload");
                Ok::<_, SupervisorError>(Poll::Pending)
            })
            .await;

            match result {
                Ok(()) => {
                    info!(before, after = after.load(Ordering::SeqCst), "monit reloaded");
                    return Ok(());
                }
                Err(PollError::Check(e)) => return Err(e),
                Err(PollError::Exhausted { .. }) | Err(PollError::DeadlineExceeded { .. }) => {}
            }
        }

        Err(SupervisorError::ReloadTimeout {
            before,
            after: after.load(Ordering::SeqCst),
        })
    }

    /// Start every service in the job group.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let services = self.group_services().await?;
        for service in &services {
            info!(service = %service, "Starting service");
            self.client
                .start_service(service)
                .await
                .map_err(|e| SupervisorError::monit(format!("Starting service {}", service), e))?;
        }
        Ok(())
    }

    /// Stop every service in the job group and wait until none is monitored.
    ///
    /// Fails as soon as any service reports an execution error, or after
    /// [`STOP_TIMEOUT`] naming the services still pending.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let services = self.group_services().await?;
        for service in &services {
            info!(service = %service, "Stopping service");
            self.client.stop_service(service).await.map_err(|e| {
                SupervisorError::monit(format!("Stopping service '{}'", service), e)
            })?;
        }

        let pending: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let pending_ref = &pending;
        let options = PollOptions::deadline(STOP_TIMEOUT, STOP_POLL_INTERVAL);
        let result = poll_until(self.clock.as_ref(), options, move || async move {
            let status = self
                .client
                .status()
                .await
                .map_err(|e| SupervisorError::monit("Getting monit status", e))?;

            let mut still_running = Vec::new();
            for service in status.services_in_group(&self.group) {
                if service.errored {
                    return Err(SupervisorError::ServiceErrored {
                        service: service.name.clone(),
                        message: service.status_message.clone(),
                    });
                }
                if service.monitored || service.pending {
                    still_running.push(service.name.clone());
                }
            }

            let done = still_running.is_empty();
            if !done {
                debug!(services = ?still_running, "Waiting for services to stop");
            }
            *pending_ref.lock().unwrap_or_else(|e| e.into_inner()) = still_running;
            Ok::<_, SupervisorError>(if done { Poll::Ready(()) } else { Poll::Pending })
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::Check(e)) => Err(e),
            Err(PollError::Exhausted { .. }) | Err(PollError::DeadlineExceeded { .. }) => {
                let services = pending.into_inner().unwrap_or_else(|e| e.into_inner());
                Err(SupervisorError::StopTimeout { services })
            }
        }
    }

    /// Stop monitoring every service in the job group.
    pub async fn unmonitor(&self) -> Result<(), SupervisorError> {
        let services = self.group_services().await?;
        for service in &services {
            self.client.unmonitor_service(service).await.map_err(|e| {
                SupervisorError::monit(format!("Unmonitoring service {}", service), e)
            })?;
        }
        Ok(())
    }

    /// Aggregate status of the job group.
    ///
    /// `starting` wins over everything; any unmonitored or non-running
    /// service makes the group `failing`. An unreachable monit is `unknown`.
    pub async fn status(&self) -> JobStatus {
        let status = match self.client.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Getting monit status");
                return JobStatus::Unknown;
            }
        };

        let services = status.services_in_group(&self.group);
        if services.iter().any(|s| s.status == "starting") {
            return JobStatus::Starting;
        }
        if services
            .iter()
            .any(|s| !s.monitored || s.status != "running")
        {
            return JobStatus::Failing;
        }
        JobStatus::Running
    }

    /// Enable the monit runit service and start it.
    ///
    /// `sv start` is retried while runit picks up the new service link.
    pub async fn start_monit(&self) -> Result<(), SupervisorError> {
        let target = self.sv_dir.join("monit");
        let link = self.service_dir.join("monit");
        match tokio::fs::remove_file(&link).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SupervisorError::config("Removing monit service link", e)),
        }
        tokio::fs::symlink(&target, &link)
            .await
            .map_err(|e| SupervisorError::config("Symlinking monit service", e))?;

        let last_error: Mutex<Option<CmdError>> = Mutex::new(None);
        let last_error_ref = &last_error;
        let options = PollOptions::attempts(START_MONIT_ATTEMPTS, START_MONIT_INTERVAL);
        let result = poll_until(self.clock.as_ref(), options, move || async move {
            match self.runner.run_command("sv", &["start", "monit"]).await {
                Ok(_) => Ok::<_, SupervisorError>(Poll::Ready(())),
                Err(e) => {
                    debug!(error = %e, "monit not started yet");
                    *last_error_ref.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
                    Ok(Poll::Pending)
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(link = %link.display(), "Started monit");
                Ok(())
            }
            Err(PollError::Check(e)) => Err(e),
            Err(PollError::Exhausted { attempts }) | Err(PollError::DeadlineExceeded { attempts }) => {
                match last_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
                    Some(source) => Err(SupervisorError::StartMonit { attempts, source }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Write fresh monit credentials for `vcap` to `path`, readable by root
    /// only. Runs before any client exists, since the client needs them.
    pub async fn setup_monit_user(path: &Path) -> Result<MonitCredentials, SupervisorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SupervisorError::config("Creating monit user directory", e))?;
        }

        let credentials = MonitCredentials::generate("vcap");
        tokio::fs::write(path, credentials.to_content())
            .await
            .map_err(|e| SupervisorError::config("Writing monit user file", e))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| SupervisorError::config("Restricting monit user file", e))?;

        info!(path = %path.display(), "Wrote monit user");
        Ok(credentials)
    }

    /// Register a job's monit configuration as `NNNN_<name>.monitrc`.
    ///
    /// The zero-padded index keeps monit's include order stable.
    pub async fn add_job(
        &self,
        name: &str,
        index: usize,
        config_path: &Path,
    ) -> Result<PathBuf, SupervisorError> {
        let config = tokio::fs::read(config_path)
            .await
            .map_err(|e| SupervisorError::config("Reading job config from file", e))?;

        tokio::fs::create_dir_all(&self.jobs_dir)
            .await
            .map_err(|e| SupervisorError::config("Creating monit jobs directory", e))?;

        let target = self.jobs_dir.join(job_file_name(name, index));
        tokio::fs::write(&target, config)
            .await
            .map_err(|e| SupervisorError::config("Writing to job config file", e))?;

        info!(job = %name, index, path = %target.display(), "Added job");
        Ok(target)
    }

    /// Remove every registered job configuration.
    pub async fn remove_all_jobs(&self) -> Result<(), SupervisorError> {
        match tokio::fs::remove_dir_all(&self.jobs_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::config("Removing monit jobs directory", e)),
        }
    }

    async fn group_services(&self) -> Result<Vec<String>, SupervisorError> {
        self.client
            .services_in_group(&self.group)
            .await
            .map_err(|e: MonitError| {
                SupervisorError::monit(format!("Getting {} services", self.group), e)
            })
    }
}

/// File name of a job's monit configuration.
pub fn job_file_name(name: &str, index: usize) -> String {
    format!("{:04}_{}.monitrc", index, name)
}
