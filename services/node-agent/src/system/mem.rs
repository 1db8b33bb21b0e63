//! Host memory statistics.
//!
//! Ephemeral swap sizing depends on total system memory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Source of host memory statistics.
#[async_trait]
pub trait MemoryStats: Send + Sync {
    /// Total system memory in bytes.
    async fn total_memory_bytes(&self) -> Result<u64>;
}

/// Reads memory statistics from `/proc/meminfo`.
pub struct ProcMemoryStats {
    meminfo_path: PathBuf,
}

impl ProcMemoryStats {
    /// Read from the standard `/proc/meminfo`.
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    /// Read from an alternate meminfo file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: path.into(),
        }
    }
}

impl Default for ProcMemoryStats {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStats for ProcMemoryStats {
    async fn total_memory_bytes(&self) -> Result<u64> {
        let content = tokio::fs::read_to_string(&self.meminfo_path)
            .await
            .with_context(|| format!("reading {}", self.meminfo_path.display()))?;

        parse_mem_total(&content).context("MemTotal not found in meminfo")
    }
}

/// Extract `MemTotal` from meminfo content, in bytes.
fn parse_mem_total(content: &str) -> Option<u64> {
    const KB_TO_BYTES: u64 = 1024;

    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["MemTotal:", value, ..] => value.parse::<u64>().ok().map(|kb| kb * KB_TO_BYTES),
            _ => None,
        }
    })
}

/// Mock memory stats for testing.
pub struct MockMemoryStats {
    total: Option<u64>,
}

impl MockMemoryStats {
    /// Report the given total memory.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total: Some(total_bytes),
        }
    }

    /// Fail every query.
    pub fn failing() -> Self {
        Self { total: None }
    }
}

#[async_trait]
impl MemoryStats for MockMemoryStats {
    async fn total_memory_bytes(&self) -> Result<u64> {
        self.total
            .ok_or_else(|| anyhow::anyhow!("memory stats unavailable"))
    }
}
