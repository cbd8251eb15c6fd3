//! Load balancer liveness checks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::MonitorError;

/// Reports whether the load balancer process is alive.
///
/// Watching is suspended by the configurer while a reload replaces the process.
pub trait ProcessMonitor: Send + Sync {
    /// Whether the load balancer process currently exists.
    fn is_running(&self) -> bool;

    /// Resume supervision after a reload.
    fn start_watching(&self);

    /// Suspend supervision during a reload.
    fn stop_watching(&self);
}

/// Checks the process named by the load balancer's PID file.
#[derive(Debug)]
pub struct PidFileMonitor {
    pid_file: PathBuf,
    watching: AtomicBool,
}

impl PidFileMonitor {
    /// Monitor the process whose id is stored in `pid_file`. Watching starts enabled.
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            watching: AtomicBool::new(true),
        }
    }

    /// The PID file being read.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    fn read_pid(&self) -> Option<Pid> {
        let contents = std::fs::read_to_string(&self.pid_file).ok()?;
        contents.trim().parse::<u32>().ok().map(Pid::from_u32)
    }

    /// Spawn-friendly supervision loop.
    ///
    /// Returns an error when the process disappears while watching is enabled, which
    /// ends the whole service. Returns `Ok` on shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), MonitorError> {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // Prevent immediately ticking when spawned
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if !self.is_watching() {
                continue;
            }

            if !self.is_running() {
                tracing::error!(
                    pid_file = %self.pid_file.display(),
                    "load balancer process is not running"
                );
                return Err(MonitorError::ProcessExited(self.pid_file.clone()));
            }
        }
    }
}

impl ProcessMonitor for PidFileMonitor {
    fn is_running(&self) -> bool {
        let Some(pid) = self.read_pid() else {
            return false;
        };
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).is_some()
    }

    fn start_watching(&self) {
        self.watching.store(true, Ordering::Release);
    }

    fn stop_watching(&self) {
        self.watching.store(false, Ordering::Release);
    }
}
