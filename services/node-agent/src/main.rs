//! Bedrock Node Agent
//!
//! Prepares the host's disks, then supervises the job processes.
//!
//! ## Startup
//!
//! 1. Label raw ephemeral disks
//! 2. Partition, format and mount the ephemeral disk (or root disk space)
//! 3. Grow the root filesystem
//! 4. Move the system directories onto the data directory
//! 5. Write monit credentials, start monit and listen for job failure alerts

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bedrock_node_agent::config::Config;
use bedrock_node_agent::disk::{DiskCollaborators, DiskManager};
use bedrock_node_agent::state::StateStore;
use bedrock_node_agent::supervisor::{
    monitor_job_failures, HttpMonitClient, JobSupervisor, LoggingFailureHandler,
};
use bedrock_node_agent::system::{Clock, CmdRunner, ExecCmdRunner, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        base_dir = %config.paths.base_dir().display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting bedrock node agent"
    );

    let runner: Arc<dyn CmdRunner> = Arc::new(ExecCmdRunner::new().with_tmp_dir(&config.tmp_dir));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let state = StateStore::new(config.paths.clone());
    match state.stemcell_version().await {
        Ok(version) => info!(stemcell_version = %version, "Read stemcell version"),
        Err(e) => warn!(error = %e, "Stemcell version unavailable"),
    }

    let disks = DiskManager::new(
        DiskCollaborators::linux(runner.clone(), clock.clone(), &config.disk),
        config.paths.clone(),
        config.disk.clone(),
    );

    disks
        .label_raw_ephemeral_disks(&config.raw_ephemeral_disks)
        .await
        .context("labeling raw ephemeral disks")?;

    let ephemeral_device = match &config.ephemeral_disk {
        Some(settings) => disks.ephemeral_disk_path(settings).await,
        None => None,
    };

    disks
        .setup_ephemeral_disk(ephemeral_device.as_deref(), config.swap_size_bytes)
        .await
        .context("setting up ephemeral disk")?;

    disks
        .grow_root_filesystem(ephemeral_device.as_deref())
        .await
        .context("growing root filesystem")?;

    disks.setup_data_dir().await.context("setting up data dir")?;
    disks.setup_tmp_dir().await.context("setting up tmp dir")?;
    disks.setup_log_dir().await.context("setting up log dir")?;
    disks.setup_blobs_dir().await.context("setting up blobs dir")?;
    disks.setup_home_dir().await.context("setting up home dir")?;
    disks
        .setup_shared_memory()
        .await
        .context("setting up shared memory")?;

    info!("Disk setup complete");

    let credentials = JobSupervisor::setup_monit_user(&config.monit.credentials_path)
        .await
        .context("setting up monit user")?;
    let client = Arc::new(HttpMonitClient::new(&config.monit.url, credentials));
    let supervisor = JobSupervisor::new(
        runner.clone(),
        client,
        clock.clone(),
        config.paths.monit_jobs_dir(),
        &config.monit.group,
    )
    .with_reload_options(config.monit.reload.clone());

    supervisor.start_monit().await.context("starting monit")?;

    let listener = monitor_job_failures(
        config.monit.job_failures_port,
        Arc::new(LoggingFailureHandler),
    )
    .await?;

    info!(status = %supervisor.status().await, "Job status");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Waiting for shutdown signal"),
    }

    listener.abort();
    info!("Node agent shutdown complete");
    Ok(())
}
