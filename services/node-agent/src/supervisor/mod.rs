//! Process supervision through monit.
//!
//! - `monit`: the monit HTTP client and status model
//! - `job`: job registration, reload, start, stop and aggregate status
//! - `alert`: the SMTP receiver for monit failure alerts

mod alert;
mod error;
mod job;
mod monit;

pub use alert::{
    monitor_job_failures, FailureAlert, FailureListener, JobFailureHandler, LoggingFailureHandler,
    MockJobFailureHandler,
};
pub use error::{MonitError, SupervisorError};
pub use job::{
    job_file_name, JobStatus, JobSupervisor, ReloadOptions, START_MONIT_ATTEMPTS,
    START_MONIT_INTERVAL, STOP_POLL_INTERVAL, STOP_TIMEOUT,
};
pub use monit::{
    HttpMonitClient, MockMonitClient, MonitAction, MonitClient, MonitCredentials, MonitStatus,
    ServiceGroup, ServiceStatus,
};
