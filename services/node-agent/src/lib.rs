//! Bedrock Node Agent Library
//!
//! The node agent runs on every host of a deployment. It prepares the
//! host's storage before any job runs and supervises the job processes
//! through monit afterwards.
//!
//! ## Architecture
//!
//! ```text
//! main
//! ├── DiskManager     (ephemeral, root, raw and persistent disks)
//! ├── JobSupervisor   (monit reload, start, stop, status)
//! └── FailureListener (SMTP receiver for monit alerts)
//! ```
//!
//! Every external tool and daemon is reached through a trait in `system`,
//! `disk` or `supervisor` with a mock next to the real implementation.
//!
//! ## Modules
//!
//! - `config`: environment configuration and fixed agent paths
//! - `disk`: disk layout management
//! - `state`: small agent state files
//! - `supervisor`: process supervision through monit
//! - `system`: command execution, clock, polling, memory statistics

pub mod config;
pub mod disk;
pub mod state;
pub mod supervisor;
pub mod system;

pub use config::{AgentPaths, Config, DiskOptions, MonitConfig};
pub use disk::{DiskCollaborators, DiskError, DiskManager, DiskSettings};
pub use supervisor::{JobStatus, JobSupervisor, SupervisorError};
