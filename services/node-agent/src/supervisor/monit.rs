//! monit client.
//!
//! monit exposes its state over a small HTTP interface: `/_status2?format=xml`
//! returns every service with its monitoring flags, and posting
//! `action=<verb>` to `/<service>` starts, stops or unmonitors it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use super::error::MonitError;

/// monit's event bit for a failed program execution.
const EVENT_EXEC: u32 = 0x1000;

/// Length of a generated monit password.
const PASSWORD_LEN: usize = 20;

/// Status of one monit service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub monitored: bool,
    /// An action (start, stop, restart) has been requested but not finished.
    pub pending: bool,
    pub errored: bool,
    /// One of `running`, `failing`, `starting`, `unknown`.
    pub status: String,
    pub status_message: String,
}

impl ServiceStatus {
    pub fn new(name: &str, status: &str) -> Self {
        Self {
            name: name.to_string(),
            monitored: true,
            pending: false,
            errored: false,
            status: status.to_string(),
            status_message: String::new(),
        }
    }

    pub fn unmonitored(mut self) -> Self {
        self.monitored = false;
        self
    }

    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub fn errored(mut self, message: &str) -> Self {
        self.errored = true;
        self.status_message = message.to_string();
        self
    }
}

/// A group of services as monit reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceGroup {
    pub name: String,
    pub services: Vec<String>,
}

/// Snapshot of monit's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitStatus {
    /// Changes every time monit (re)loads its configuration.
    pub incarnation: i64,
    pub services: Vec<ServiceStatus>,
    pub groups: Vec<ServiceGroup>,
}

impl MonitStatus {
    /// Services belonging to `group`, in group order.
    pub fn services_in_group(&self, group: &str) -> Vec<&ServiceStatus> {
        let Some(group) = self.groups.iter().find(|g| g.name == group) else {
            return Vec::new();
        };
        group
            .services
            .iter()
            .filter_map(|name| self.services.iter().find(|s| &s.name == name))
            .collect()
    }

    /// Parse the XML document served at `/_status2?format=xml`.
    pub fn from_xml(xml: &str) -> Result<Self, MonitError> {
        let doc: StatusXml = quick_xml::de::from_str(xml)?;

        let services = doc
            .services
            .service
            .into_iter()
            .map(ServiceXml::into_status)
            .collect();
        let groups = doc
            .servicegroups
            .map(|g| g.servicegroup)
            .unwrap_or_default()
            .into_iter()
            .map(|g| ServiceGroup {
                name: g.name,
                services: g.service,
            })
            .collect();

        Ok(Self {
            incarnation: doc.incarnation,
            services,
            groups,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusXml {
    #[serde(rename = "@incarnation", default)]
    incarnation: i64,
    #[serde(default)]
    services: ServicesXml,
    servicegroups: Option<ServiceGroupsXml>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesXml {
    #[serde(default)]
    service: Vec<ServiceXml>,
}

#[derive(Debug, Deserialize)]
struct ServiceXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    status: u32,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    monitor: u32,
    #[serde(default)]
    pendingaction: u32,
}

impl ServiceXml {
    fn into_status(self) -> ServiceStatus {
        let status = match (self.monitor, self.status) {
            (0, _) => "unknown",
            (2, _) => "starting",
            (_, 0) => "running",
            _ => "failing",
        };
        ServiceStatus {
            name: self.name,
            monitored: self.monitor > 0,
            pending: self.pendingaction > 0,
            errored: self.status & EVENT_EXEC != 0,
            status: status.to_string(),
            status_message: self.status_message.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceGroupsXml {
    #[serde(default)]
    servicegroup: Vec<ServiceGroupXml>,
}

#[derive(Debug, Deserialize)]
struct ServiceGroupXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    service: Vec<String>,
}

/// Operations on the local monit daemon.
#[async_trait]
pub trait MonitClient: Send + Sync {
    /// Names of the services in `group`.
    async fn services_in_group(&self, group: &str) -> Result<Vec<String>, MonitError>;

    async fn start_service(&self, name: &str) -> Result<(), MonitError>;

    async fn stop_service(&self, name: &str) -> Result<(), MonitError>;

    async fn unmonitor_service(&self, name: &str) -> Result<(), MonitError>;

    async fn status(&self) -> Result<MonitStatus, MonitError>;
}

/// Credentials for monit's HTTP interface.
#[derive(Clone, PartialEq, Eq)]
pub struct MonitCredentials {
    pub username: String,
    pub password: String,
}

impl MonitCredentials {
    /// Fresh credentials for `username` with a random alphanumeric password.
    pub fn generate(username: &str) -> Self {
        let chars = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::rng();
        let password = (0..PASSWORD_LEN)
            .map(|_| chars[rng.random_range(0..chars.len())] as char)
            .collect();
        Self {
            username: username.to_string(),
            password,
        }
    }

    /// The `user:password` form monit reads.
    pub fn to_content(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Parse `user:password`. Surrounding whitespace is ignored.
    pub fn parse(content: &str) -> Result<Self, MonitError> {
        let (username, password) = content
            .trim()
            .split_once(':')
            .ok_or(MonitError::MalformedCredentials)?;
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self, MonitError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| MonitError::Credentials {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::parse(&content)
    }
}

impl std::fmt::Debug for MonitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// monit client over its HTTP interface.
pub struct HttpMonitClient {
    client: reqwest::Client,
    base_url: String,
    credentials: MonitCredentials,
}

impl HttpMonitClient {
    pub fn new(base_url: &str, credentials: MonitCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn service_action(&self, name: &str, action: &str) -> Result<(), MonitError> {
        let url = format!("{}/{}", self.base_url, name);
        debug!(service = %name, action = %action, "Sending monit service action");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .form(&[("action", action)])
            .send()
            .await?;

        check_response(response).await.map(|_| ())
    }
}

async fn check_response(response: reqwest::Response) -> Result<String, MonitError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(MonitError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[async_trait]
impl MonitClient for HttpMonitClient {
    async fn services_in_group(&self, group: &str) -> Result<Vec<String>, MonitError> {
        let status = self.status().await?;
        Ok(status
            .services_in_group(group)
            .into_iter()
            .map(|s| s.name.clone())
            .collect())
    }

    async fn start_service(&self, name: &str) -> Result<(), MonitError> {
        self.service_action(name, "start").await
    }

    async fn stop_service(&self, name: &str) -> Result<(), MonitError> {
        self.service_action(name, "stop").await
    }

    async fn unmonitor_service(&self, name: &str) -> Result<(), MonitError> {
        self.service_action(name, "unmonitor").await
    }

    async fn status(&self) -> Result<MonitStatus, MonitError> {
        let url = format!("{}/_status2?format=xml", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        let body = check_response(response).await?;
        MonitStatus::from_xml(&body)
    }
}

/// An action recorded by [`MockMonitClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitAction {
    Start(String),
    Stop(String),
    Unmonitor(String),
}

/// Mock monit client for testing.
///
/// Status snapshots are answered in the order they were queued; the last one
/// keeps being returned once the queue drains. A queued `None` answers with
/// an error.
pub struct MockMonitClient {
    group_services: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<Option<MonitStatus>>>,
    actions: Mutex<Vec<MonitAction>>,
    failing_actions: Mutex<Vec<MonitAction>>,
    services_error: Mutex<bool>,
    status_calls: Mutex<usize>,
}

impl MockMonitClient {
    pub fn new() -> Self {
        Self {
            group_services: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::new()),
            actions: Mutex::new(Vec::new()),
            failing_actions: Mutex::new(Vec::new()),
            services_error: Mutex::new(false),
            status_calls: Mutex::new(0),
        }
    }

    /// Services reported by [`MonitClient::services_in_group`].
    pub fn set_group_services(&self, services: &[&str]) {
        *self
            .group_services
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_services_in_group(&self) {
        *self.services_error.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn push_status(&self, status: MonitStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Some(status));
    }

    pub fn push_status_error(&self) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(None);
    }

    /// Queue snapshots that only differ by incarnation.
    pub fn push_incarnations(&self, incarnations: &[i64]) {
        for &incarnation in incarnations {
            self.push_status(MonitStatus {
                incarnation,
                ..Default::default()
            });
        }
    }

    /// Make the given action fail.
    pub fn fail_action(&self, action: MonitAction) {
        self.failing_actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    pub fn actions(&self) -> Vec<MonitAction> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, action: MonitAction) -> Result<(), MonitError> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action.clone());

        let failing = self
            .failing_actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&action);
        if failing {
            return Err(MonitError::Unavailable(format!("{:?} failed", action)));
        }
        Ok(())
    }
}

impl Default for MockMonitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitClient for MockMonitClient {
    async fn services_in_group(&self, _group: &str) -> Result<Vec<String>, MonitError> {
        if *self.services_error.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(MonitError::Unavailable("listing services".to_string()));
        }
        Ok(self
            .group_services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn start_service(&self, name: &str) -> Result<(), MonitError> {
        self.record(MonitAction::Start(name.to_string()))
    }

    async fn stop_service(&self, name: &str) -> Result<(), MonitError> {
        self.record(MonitAction::Stop(name.to_string()))
    }

    async fn unmonitor_service(&self, name: &str) -> Result<(), MonitError> {
        self.record(MonitAction::Unmonitor(name.to_string()))
    }

    async fn status(&self) -> Result<MonitStatus, MonitError> {
        *self.status_calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let next = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };

        match next {
            Some(Some(status)) => Ok(status),
            Some(None) => Err(MonitError::Unavailable("status".to_string())),
            None => Ok(MonitStatus::default()),
        }
    }
}
