//! Liveness of co-located processes
//!
//! Two probes:
//! - [`PidFileSupervisor`] reads each configured pid file, checks the pid,
//!   and restarts a dead process as a detached child with its output appended
//!   to a log file.
//! - [`BusRoundTripProbe`] is used when everything runs in one process: a
//!   message published on the ping subject must come back.

use crate::error::RecoveryError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use warden_core::bus::subjects;
use warden_core::config::ProcessConfig;
use warden_core::{BusError, MessageBus};

/// Liveness of one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    /// Configured process name, or `bus` for the round-trip check
    pub name: String,
    /// Running after this check, including a successful restart
    pub alive: bool,
    /// Pid currently on record
    pub pid: Option<u32>,
    /// A restart was issued during this check
    pub restarted: bool,
    /// Restart or round-trip failure, or the pid that was replaced
    pub detail: Option<String>,
}

impl ProcessStatus {
    fn alive(name: &str, pid: Option<u32>) -> Self {
        Self {
            name: name.to_string(),
            alive: true,
            pid,
            restarted: false,
            detail: None,
        }
    }
}

/// Liveness probe
#[async_trait::async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Check (and where possible revive) every supervised process
    async fn check(&self) -> Vec<ProcessStatus>;
}

/// Pid-file based supervision of co-located processes
///
/// Children started by a restart are kept so their exit can be reaped;
/// an unreaped child would otherwise linger as a zombie whose pid still
/// looks alive.
#[derive(Debug, Clone, Default)]
pub struct PidFileSupervisor {
    processes: Vec<ProcessConfig>,
    children: Arc<Mutex<HashMap<String, Child>>>,
}

impl PidFileSupervisor {
    /// Supervise the given processes
    #[must_use]
    pub fn new(processes: Vec<ProcessConfig>) -> Self {
        Self {
            processes,
            children: Arc::default(),
        }
    }

    /// Read a pid file; `None` when missing or unparsable
    #[must_use]
    pub fn read_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Check whether a pid refers to a running process; zombies are not
    pub async fn is_running(pid: u32) -> bool {
        if Path::new("/proc/self").exists() {
            return match tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
                Ok(stat) => !is_defunct(&stat),
                Err(_) => false,
            };
        }
        tokio::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Start a process detached, appending its output to the log file and
    /// writing the new pid file
    ///
    /// # Errors
    /// - `RecoveryError::Restart` if the log or pid file cannot be written or
    ///   the program cannot be spawned
    pub fn restart(process: &ProcessConfig) -> Result<(u32, Child), RecoveryError> {
        let fail = |reason: String| RecoveryError::Restart {
            name: process.name.clone(),
            reason,
        };
        if let Some(dir) = process.log_file.parent() {
            std::fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&process.log_file)
            .map_err(|e| fail(format!("log file {}: {e}", process.log_file.display())))?;
        let log_err = log.try_clone().map_err(|e| fail(e.to_string()))?;

        let mut command = std::process::Command::new(&process.program);
        command
            .args(&process.args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|e| fail(e.to_string()))?;
        let pid = child.id().ok_or_else(|| fail("exited before its pid was read".to_string()))?;

        if let Some(dir) = process.pid_file.parent() {
            std::fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
        }
        std::fs::write(&process.pid_file, pid.to_string()).map_err(|e| fail(e.to_string()))?;
        Ok((pid, child))
    }

    /// Collect the exit status of a child this supervisor started
    fn reap(&self, name: &str) {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(name) else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(process = %name, %status, "Supervised child exited");
                children.remove(name);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(process = %name, error = %e, "Failed to poll supervised child"),
        }
    }

    async fn check_one(&self, process: &ProcessConfig) -> ProcessStatus {
        self.reap(&process.name);
        let pid = Self::read_pid(&process.pid_file);
        if let Some(pid) = pid {
            if Self::is_running(pid).await {
                return ProcessStatus::alive(&process.name, Some(pid));
            }
        }

        tracing::warn!(process = %process.name, pid = ?pid, "Co-located process is not running, restarting");
        match Self::restart(process) {
            Ok((new_pid, child)) => {
                tracing::info!(process = %process.name, pid = new_pid, "Process restarted");
                self.children.lock().insert(process.name.clone(), child);
                ProcessStatus {
                    name: process.name.clone(),
                    alive: true,
                    pid: Some(new_pid),
                    restarted: true,
                    detail: pid.map(|old| format!("replaced dead pid {old}")),
                }
            }
            Err(e) => {
                tracing::error!(process = %process.name, error = %e, "Restart failed");
                ProcessStatus {
                    name: process.name.clone(),
                    alive: false,
                    pid,
                    restarted: false,
                    detail: Some(e.to_string()),
                }
            }
        }
    }
}

/// `Z` (zombie) or `X` (dead) in the state field of `/proc/<pid>/stat`,
/// which follows the parenthesised command name
fn is_defunct(stat: &str) -> bool {
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    matches!(state, Some("Z" | "X"))
}

#[async_trait::async_trait]
impl LivenessProbe for PidFileSupervisor {
    async fn check(&self) -> Vec<ProcessStatus> {
        let checks = self.processes.iter().map(|process| self.check_one(process));
        futures::future::join_all(checks).await
    }
}

/// Single-process liveness: publish on the ping subject and wait for it
pub struct BusRoundTripProbe {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl BusRoundTripProbe {
    /// Create a probe with a round-trip budget
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    async fn round_trip(&self) -> Result<Duration, BusError> {
        let start = tokio::time::Instant::now();
        let token = uuid::Uuid::new_v4().to_string();
        let mut sub = self.bus.subscribe(subjects::PING).await?;
        self.bus
            .publish(subjects::PING, token.clone().into_bytes(), Some(&format!("ping-{token}")))
            .await?;
        let wait = async {
            while let Some(message) = sub.next().await {
                if message.payload == token.as_bytes() {
                    return Ok(start.elapsed());
                }
            }
            Err(BusError::Disconnected)
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| BusError::Timeout(self.timeout))?
    }
}

#[async_trait::async_trait]
impl LivenessProbe for BusRoundTripProbe {
    async fn check(&self) -> Vec<ProcessStatus> {
        let status = match self.round_trip().await {
            Ok(latency) => ProcessStatus {
                detail: Some(format!("round-trip {}ms", latency.as_millis())),
                ..ProcessStatus::alive("bus", None)
            },
            Err(e) => {
                tracing::warn!(error = %e, "Bus round-trip failed");
                ProcessStatus {
                    name: "bus".to_string(),
                    alive: false,
                    pid: None,
                    restarted: false,
                    detail: Some(e.to_string()),
                }
            }
        };
        vec![status]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::InMemoryBus;

    #[test]
    fn read_pid_handles_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");
        assert_eq!(PidFileSupervisor::read_pid(&path), None);
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(PidFileSupervisor::read_pid(&path), None);
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(PidFileSupervisor::read_pid(&path), Some(1234));
    }

    #[tokio::test]
    async fn own_process_is_running() {
        assert!(PidFileSupervisor::is_running(std::process::id()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_process_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let process = ProcessConfig {
            name: "sleeper".into(),
            program: "sleep".into(),
            args: vec!["5".into()],
            pid_file: dir.path().join("run/sleeper.pid"),
            log_file: dir.path().join("log/sleeper.log"),
        };
        // pid that cannot exist
        std::fs::create_dir_all(dir.path().join("run")).unwrap();
        std::fs::write(&process.pid_file, "4194305").unwrap();

        let supervisor = PidFileSupervisor::new(vec![process.clone()]);
        let statuses = supervisor.check().await;

        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].restarted);
        assert!(statuses[0].alive);
        let pid = PidFileSupervisor::read_pid(&process.pid_file).unwrap();
        assert_eq!(statuses[0].pid, Some(pid));
        assert!(process.log_file.exists());
    }

    #[test]
    fn defunct_states_from_proc_stat() {
        assert!(is_defunct("4242 (worker) Z 1 4242 4242 0 -1"));
        assert!(is_defunct("4242 (odd ) name) X 1"));
        assert!(!is_defunct("4242 (worker) S 1 4242 4242 0 -1"));
        assert!(!is_defunct("garbage"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_is_reaped_and_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let process = ProcessConfig {
            name: "crasher".into(),
            program: "sh".into(),
            args: vec!["-c".into(), "exit 1".into()],
            pid_file: dir.path().join("crasher.pid"),
            log_file: dir.path().join("crasher.log"),
        };
        let supervisor = PidFileSupervisor::new(vec![process]);

        let first = supervisor.check().await;
        assert!(first[0].restarted);
        let first_pid = first[0].pid.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = supervisor.check().await;

        assert!(second[0].restarted, "exited child still reported alive: {:?}", second[0]);
        assert_eq!(second[0].detail, Some(format!("replaced dead pid {first_pid}")));
        assert_ne!(second[0].pid, Some(first_pid));
    }

    #[tokio::test]
    async fn missing_program_reports_dead() {
        let dir = tempfile::tempdir().unwrap();
        let process = ProcessConfig {
            name: "ghost".into(),
            program: "/nonexistent/warden-ghost".into(),
            args: vec![],
            pid_file: dir.path().join("ghost.pid"),
            log_file: dir.path().join("ghost.log"),
        };
        let statuses = PidFileSupervisor::new(vec![process]).check().await;
        assert!(!statuses[0].alive);
        assert!(statuses[0].detail.is_some());
    }

    #[tokio::test]
    async fn bus_round_trip() {
        let bus = Arc::new(InMemoryBus::new());
        let probe = BusRoundTripProbe::new(bus.clone(), Duration::from_secs(1));
        assert!(probe.check().await[0].alive);

        bus.set_connected(false);
        assert!(!probe.check().await[0].alive);
    }
}
