//! Job failure notifications.
//!
//! monit reports service failures by mail. The agent runs a minimal SMTP
//! receiver on the loopback interface, turns each delivered message into a
//! [`FailureAlert`] and hands it to a [`JobFailureHandler`] on a separate
//! task, so a slow handler never stalls monit's delivery.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SupervisorError;

/// Queued alerts waiting for the handler.
const ALERT_QUEUE_SIZE: usize = 64;

/// Longest accepted line, including the terminator.
const MAX_LINE_LEN: usize = 4096;

/// A failure reported by monit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureAlert {
    pub id: String,
    pub service: String,
    pub event: String,
    pub action: String,
    pub date: String,
    pub description: String,
    /// Unix seconds parsed from `date`, when it is a valid RFC 2822 date.
    pub created_at: Option<i64>,
}

impl FailureAlert {
    /// Parse a monit alert mail. Header and body lines are both scanned for
    /// `Key: value` pairs; the message has to name a service.
    pub fn parse(message: &str) -> Option<Self> {
        let mut alert = FailureAlert {
            id: String::new(),
            service: String::new(),
            event: String::new(),
            action: String::new(),
            date: String::new(),
            description: String::new(),
            created_at: None,
        };

        for line in message.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "message-id" => alert.id = value,
                "service" => alert.service = value,
                "event" => alert.event = value,
                "action" => alert.action = value,
                "date" => alert.date = value,
                "description" => alert.description = value,
                _ => {}
            }
        }

        if alert.service.is_empty() {
            return None;
        }

        alert.created_at = DateTime::parse_from_rfc2822(&alert.date)
            .ok()
            .map(|d| d.timestamp());
        Some(alert)
    }
}

/// Receives job failures.
#[async_trait]
pub trait JobFailureHandler: Send + Sync {
    async fn handle_job_failure(&self, alert: FailureAlert) -> anyhow::Result<()>;
}

/// Logs every failure, with the full alert as JSON.
pub struct LoggingFailureHandler;

#[async_trait]
impl JobFailureHandler for LoggingFailureHandler {
    async fn handle_job_failure(&self, alert: FailureAlert) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&alert)?;
        warn!(
            service = %alert.service,
            event = %alert.event,
            alert = %payload,
            "Job failure reported"
        );
        Ok(())
    }
}

/// Mock handler forwarding alerts to a channel.
pub struct MockJobFailureHandler {
    tx: mpsc::UnboundedSender<FailureAlert>,
}

impl MockJobFailureHandler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FailureAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobFailureHandler for MockJobFailureHandler {
    async fn handle_job_failure(&self, alert: FailureAlert) -> anyhow::Result<()> {
        self.tx
            .send(alert)
            .map_err(|_| anyhow::anyhow!("alert receiver dropped"))
    }
}

/// A running failure listener.
pub struct FailureListener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    handler_task: JoinHandle<()>,
}

impl FailureListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and drop queued alerts.
    pub fn abort(&self) {
        self.accept_task.abort();
        self.handler_task.abort();
    }
}

/// Listen for monit alert mail on `127.0.0.1:port` and deliver each alert to
/// `handler`. Port 0 picks a free port.
pub async fn monitor_job_failures(
    port: u16,
    handler: Arc<dyn JobFailureHandler>,
) -> Result<FailureListener, SupervisorError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| SupervisorError::Listen { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| SupervisorError::Listen { addr, source })?;

    info!(addr = %local_addr, "Listening for job failures");

    let (tx, mut rx) = mpsc::channel::<FailureAlert>(ALERT_QUEUE_SIZE);

    let handler_task = tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            let service = alert.service.clone();
            if let Err(e) = handler.handle_job_failure(alert).await {
                warn!(service = %service, error = %e, "Job failure handler failed");
            }
        }
    });

    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, tx).await {
                            debug!(peer = %peer, error = %e, "SMTP session ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accepting SMTP connection"),
            }
        }
    });

    Ok(FailureListener {
        local_addr,
        accept_task,
        handler_task,
    })
}

async fn serve_connection(
    stream: TcpStream,
    alerts: mpsc::Sender<FailureAlert>,
) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    serve_session(reader, writer, alerts).await
}

/// One SMTP session. Only what monit's mailer needs is understood.
async fn serve_session<R, W>(
    reader: R,
    mut writer: W,
    alerts: mpsc::Sender<FailureAlert>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    reply(&mut writer, "220 localhost bedrock node agent ESMTP").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if read_line(&mut reader, &mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match verb.as_str() {
            "HELO" | "EHLO" => reply(&mut writer, "250 localhost").await?,
            "MAIL" | "RCPT" | "RSET" | "NOOP" => reply(&mut writer, "250 OK").await?,
            "DATA" => {
                reply(&mut writer, "354 End data with <CR><LF>.<CR><LF>").await?;
                let message = read_data(&mut reader).await?;
                match FailureAlert::parse(&message) {
                    Some(alert) => {
                        debug!(service = %alert.service, event = %alert.event, "Received job failure");
                        if alerts.send(alert).await.is_err() {
                            reply(&mut writer, "451 Alert handler unavailable").await?;
                            continue;
                        }
                        reply(&mut writer, "250 OK").await?;
                    }
                    None => {
                        warn!("Discarding alert without a service");
                        reply(&mut writer, "554 Malformed alert").await?;
                    }
                }
            }
            "QUIT" => {
                reply(&mut writer, "221 Bye").await?;
                return Ok(());
            }
            _ => reply(&mut writer, "500 Command not recognized").await?,
        }
    }
}

/// Read the message body up to the lone `.` line, undoing dot-stuffing.
async fn read_data<R>(reader: &mut BufReader<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut message = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if read_line(reader, &mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }
        let content = line.trim_end_matches(['\r', '\n']);
        if content == "." {
            return Ok(message);
        }
        message.push_str(content.strip_prefix('.').unwrap_or(content));
        message.push('\n');
    }
}

async fn read_line<R>(reader: &mut BufReader<R>, line: &mut String) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_line(line)
        .await?;
    if n > MAX_LINE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "SMTP line too long",
        ));
    }
    Ok(n)
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> std::io::Result<()> {
    writer.write_all(format!("{}\r\n", text).as_bytes()).await?;
    writer.flush().await
}
