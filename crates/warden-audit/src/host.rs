//! Host resource probe
//!
//! Reads CPU, memory, load, and uptime from procfs. Every field is optional
//! so a partially readable host still yields a snapshot.

use serde::Serialize;
use std::time::Duration;

/// Host resource snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostHealth {
    /// Busy share between two `/proc/stat` samples, 0-100
    pub cpu_percent: Option<f64>,
    /// Used share of total memory, 0-100
    pub memory_percent: Option<f64>,
    /// Available memory
    pub free_memory_mb: Option<u64>,
    /// One-minute load
    pub load_average: Option<f64>,
    /// Online cores; compared against the load
    pub cpu_cores: usize,
    /// Time since boot
    pub uptime_secs: Option<u64>,
    /// Set when no CPU, memory or load figure could be read
    pub error: Option<String>,
}

/// Host resource probe
#[async_trait::async_trait]
pub trait HostProbe: Send + Sync {
    /// Take a snapshot
    async fn probe(&self) -> HostHealth;
}

/// Number of logical cores
#[must_use]
pub fn detect_cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Parse the aggregate `cpu` line of `/proc/stat` into `(idle, total)` jiffies
#[must_use]
pub fn parse_cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((idle, values.iter().sum()))
}

/// CPU utilization between two `(idle, total)` samples
#[must_use]
pub fn cpu_percent(before: (u64, u64), after: (u64, u64)) -> Option<f64> {
    let total = after.1.checked_sub(before.1)?;
    let idle = after.0.checked_sub(before.0)?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(idle)) as f64 * 100.0 / total as f64)
}

/// Parse `/proc/meminfo` into `(total_kb, available_kb)`
#[must_use]
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available))
}

/// First (one-minute) value of `/proc/loadavg`
#[must_use]
pub fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

/// Whole seconds of `/proc/uptime`
#[must_use]
pub fn parse_uptime(uptime: &str) -> Option<u64> {
    let secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| secs as u64)
}

/// procfs-backed probe
#[derive(Debug, Clone)]
pub struct ProcHostProbe {
    sample_interval: Duration,
}

impl ProcHostProbe {
    /// Create a probe sampling CPU over `sample_interval`
    #[must_use]
    pub fn new(sample_interval: Duration) -> Self {
        Self { sample_interval }
    }

    async fn read(path: &str) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }
}

impl Default for ProcHostProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait::async_trait]
impl HostProbe for ProcHostProbe {
    async fn probe(&self) -> HostHealth {
        let mut health = HostHealth {
            cpu_cores: detect_cpu_cores(),
            ..HostHealth::default()
        };

        let first = Self::read("/proc/stat").await.as_deref().and_then(parse_cpu_times);
        if first.is_some() {
            tokio::time::sleep(self.sample_interval).await;
        }
        let second = Self::read("/proc/stat").await.as_deref().and_then(parse_cpu_times);
        health.cpu_percent = first.zip(second).and_then(|(a, b)| cpu_percent(a, b));

        if let Some((total, available)) = Self::read("/proc/meminfo").await.as_deref().and_then(parse_meminfo) {
            if total > 0 {
                health.memory_percent = Some((total - available.min(total)) as f64 * 100.0 / total as f64);
            }
            health.free_memory_mb = Some(available / 1024);
        }
        health.load_average = Self::read("/proc/loadavg").await.as_deref().and_then(parse_loadavg);
        health.uptime_secs = Self::read("/proc/uptime").await.as_deref().and_then(parse_uptime);

        if health.cpu_percent.is_none() && health.memory_percent.is_none() && health.load_average.is_none() {
            health.error = Some("host metrics unavailable".to_string());
        }
        health
    }
}
