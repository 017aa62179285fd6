//! Tunnel client process supervision
//!
//! One [`TunnelSupervisor`] owns the lifecycle of one tunnel client process.
//! Every mutating operation runs under the supervisor's lock, so concurrent
//! callers can never spawn two clients bound to the same relay ports.
//!
//! The PID file is the durable record of the running client, so a later,
//! unrelated invocation can still find and stop it. A client spawned by this
//! supervisor is additionally tracked through its child handle until it is
//! reaped. The temporary tunnel also sweeps stray clients still pointing at
//! its configuration when it stops.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, Layout};
use crate::error::{EngineError, Result};
use crate::process::{self, Signal};
use crate::rules::RuleSetKind;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after SIGKILL before giving up on a process we don't own
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle state of a tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TunnelState::Starting,
            2 => TunnelState::Running,
            3 => TunnelState::Stopping,
            _ => TunnelState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TunnelState::Stopped => 0,
            TunnelState::Starting => 1,
            TunnelState::Running => 2,
            TunnelState::Stopping => 3,
        }
    }
}

/// Paths and timings for one supervised tunnel
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub kind: RuleSetKind,
    pub binary_paths: Vec<PathBuf>,
    pub config_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    pub stop_timeout: Duration,
    pub restart_pause: Duration,
    /// Kill any leftover `-c <config_path>` client on stop
    pub sweep_strays: bool,
}

impl SupervisorConfig {
    pub fn for_tunnel(config: &EngineConfig, kind: RuleSetKind) -> Self {
        let layout: Layout = config.layout();
        Self {
            kind,
            binary_paths: config.binary_search_paths(),
            config_path: layout.generated_config(kind),
            pid_path: layout.pid_file(kind),
            log_path: layout.log_file(kind),
            stop_timeout: config.client.stop_timeout(),
            restart_pause: config.client.restart_pause(),
            sweep_strays: kind == RuleSetKind::Temporary,
        }
    }
}

struct Inner {
    /// Present only for processes spawned by this supervisor
    child: Option<Child>,
}

/// Owns start/stop/restart of a single tunnel client
pub struct TunnelSupervisor {
    config: SupervisorConfig,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl TunnelSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(TunnelState::Stopped.as_u8()),
            inner: Mutex::new(Inner { child: None }),
        }
    }

    pub fn kind(&self) -> RuleSetKind {
        self.config.kind
    }

    pub fn config_path(&self) -> &Path {
        &self.config.config_path
    }

    fn set_state(&self, state: TunnelState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Current state; never waits behind an in-flight operation
    pub async fn state(&self) -> TunnelState {
        if let Ok(mut inner) = self.inner.try_lock() {
            match self.refresh(&mut inner) {
                Ok(Some(_)) => self.set_state(TunnelState::Running),
                Ok(None) => self.set_state(TunnelState::Stopped),
                Err(e) => warn!("Failed to refresh {} tunnel state: {}", self.config.kind, e),
            }
        }
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub async fn is_running(&self) -> bool {
        self.pid().await.is_some()
    }

    /// PID of the live client, if any
    pub async fn pid(&self) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        match self.refresh(&mut inner) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Failed to refresh {} tunnel state: {}", self.config.kind, e);
                None
            }
        }
    }

    /// Pick up a client left running by an earlier engine instance
    pub async fn adopt(&self) -> Result<Option<u32>> {
        let mut inner = self.inner.lock().await;
        let pid = self.refresh(&mut inner)?;
        match pid {
            Some(pid) => {
                if inner.child.is_none() {
                    info!(
                        "Adopted running {} tunnel client (PID: {})",
                        self.config.kind, pid
                    );
                }
                self.set_state(TunnelState::Running);
            }
            None => self.set_state(TunnelState::Stopped),
        }
        Ok(pid)
    }

    /// Start the client; a live client makes this a no-op
    pub async fn start(&self) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner).await
    }

    /// Stop the client; an already-gone client counts as stopped
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    /// Stop, pause for port release, then start, all under one lock
    pub async fn restart(&self) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        info!("Restarting {} tunnel client", self.config.kind);
        self.stop_locked(&mut inner).await?;
        tokio::time::sleep(self.config.restart_pause).await;
        self.start_locked(&mut inner).await
    }

    /// Stop and delete the generated config, the PID file and `extra` artifacts
    pub async fn cleanup(&self, extra: &[PathBuf]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await?;

        let artifacts = [self.config.config_path.clone(), self.config.pid_path.clone()];
        for path in artifacts.iter().chain(extra.iter()) {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::storage(path, e)),
            }
        }

        info!("Cleaned up {} tunnel", self.config.kind);
        Ok(())
    }

    /// Reconcile the owned handle and the PID file with reality
    fn refresh(&self, inner: &mut Inner) -> Result<Option<u32>> {
        if let Some(child) = inner.child.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    if let Some(pid) = child.id() {
                        return Ok(Some(pid));
                    }
                    inner.child = None;
                }
                Ok(Some(status)) => {
                    warn!(
                        "{} tunnel client exited unexpectedly: {}",
                        self.config.kind, status
                    );
                    inner.child = None;
                }
                Err(e) => {
                    warn!("Failed to poll {} tunnel client: {}", self.config.kind, e);
                    inner.child = None;
                }
            }
        }

        match process::read_pid_file(&self.config.pid_path)? {
            Some(pid) if self.is_own_client(pid) => Ok(Some(pid)),
            Some(pid) => {
                debug!("Removing stale PID file for {} (PID: {})", self.config.kind, pid);
                process::remove_pid_file(&self.config.pid_path)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// A recorded PID only counts if it is still a client of our config;
    /// after a reboot the number may belong to anything
    fn is_own_client(&self, pid: u32) -> bool {
        if !process::process_exists(pid) {
            return false;
        }
        if !process::runs_with_config(pid, &self.config.config_path) {
            warn!(
                "PID {} from {:?} is not a {} tunnel client, ignoring it",
                pid, self.config.pid_path, self.config.kind
            );
            return false;
        }
        true
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<u32> {
        if let Some(pid) = self.refresh(inner)? {
            debug!("{} tunnel already running (PID: {})", self.config.kind, pid);
            self.set_state(TunnelState::Running);
            return Ok(pid);
        }

        self.set_state(TunnelState::Starting);
        match self.spawn(inner) {
            Ok(pid) => {
                self.set_state(TunnelState::Running);
                Ok(pid)
            }
            Err(e) => {
                error!("Failed to start {} tunnel: {}", self.config.kind, e);
                self.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn(&self, inner: &mut Inner) -> Result<u32> {
        let binary = process::locate_binary(&self.config.binary_paths)?;

        if !self.config.config_path.exists() {
            return Err(EngineError::ConfigMissing(self.config.config_path.clone()));
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)
            .map_err(|e| EngineError::storage(&self.config.log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| EngineError::storage(&self.config.log_path, e))?;

        let mut command = std::process::Command::new(&binary);
        command
            .arg("-c")
            .arg(&self.config.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // Own process group so signals aimed at the engine don't reach the client
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = Command::from(command).spawn().map_err(|e| {
            EngineError::Process(format!("failed to spawn {}: {}", binary.display(), e))
        })?;

        let Some(pid) = child.id() else {
            return Err(EngineError::Process(format!(
                "{} exited immediately",
                binary.display()
            )));
        };

        if let Err(e) = process::write_pid_file(&self.config.pid_path, pid) {
            let _ = child.start_kill();
            return Err(e);
        }

        info!(
            "Started {} tunnel client {} (PID: {}, log: {:?})",
            self.config.kind,
            binary.display(),
            pid,
            self.config.log_path
        );

        inner.child = Some(child);
        Ok(pid)
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        let pid = self.refresh(inner)?;
        self.set_state(TunnelState::Stopping);

        let result = match pid {
            Some(pid) => self.terminate(inner, pid).await,
            None => {
                debug!("{} tunnel not running", self.config.kind);
                Ok(())
            }
        };

        inner.child = None;
        let removed = process::remove_pid_file(&self.config.pid_path);

        if self.config.sweep_strays {
            self.sweep_strays().await;
        }

        self.set_state(TunnelState::Stopped);
        result.and(removed)
    }

    async fn terminate(&self, inner: &mut Inner, pid: u32) -> Result<()> {
        info!("Stopping {} tunnel client (PID: {})", self.config.kind, pid);
        process::send_signal(pid, Signal::Terminate)?;

        if self
            .wait_for_exit(inner.child.as_mut(), pid, self.config.stop_timeout)
            .await
        {
            info!("{} tunnel client stopped gracefully", self.config.kind);
            return Ok(());
        }

        warn!(
            "{} tunnel client (PID: {}) ignored SIGTERM for {:?}, killing",
            self.config.kind, pid, self.config.stop_timeout
        );
        process::send_signal(pid, Signal::Kill)?;

        if let Some(child) = inner.child.as_mut() {
            child
                .wait()
                .await
                .map_err(|e| EngineError::Process(format!("failed to reap {}: {}", pid, e)))?;
            return Ok(());
        }

        if !self.wait_for_exit(None, pid, KILL_WAIT).await {
            return Err(EngineError::Process(format!(
                "process {} survived SIGKILL",
                pid
            )));
        }
        Ok(())
    }

    /// Poll until `pid` is gone; owned children are reaped while polling
    async fn wait_for_exit(&self, mut child: Option<&mut Child>, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let gone = match child.as_deref_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => !process::process_exists(pid),
            };
            if gone {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn sweep_strays(&self) {
        for pid in process::find_client_processes(&self.config.config_path) {
            warn!(
                "Killing stray {} tunnel client (PID: {})",
                self.config.kind, pid
            );
            if let Err(e) = process::send_signal(pid, Signal::Terminate) {
                warn!("Failed to terminate stray {}: {}", pid, e);
                continue;
            }
            if !self.wait_for_exit(None, pid, self.config.stop_timeout).await {
                if let Err(e) = process::send_signal(pid, Signal::Kill) {
                    warn!("Failed to kill stray {}: {}", pid, e);
                }
            }
        }
    }
}
