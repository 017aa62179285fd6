//! Reconciliation controller
//!
//! The facade the outer layers talk to. Each compound operation composes
//! the lower modules in a fixed order: persist, register, install,
//! supervise. A per-tunnel lock is held for the whole sequence, both within
//! this process and, through a lock file, against other engine processes.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::drift;
use crate::error::Result;
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::lock::TunnelLock;
use crate::registration::{CloudRegistrar, Registrar};
use crate::rules::{normalize_rules, validate_rules, ForwardingRule, RuleSetKind};
use crate::store::RuleStore;
use crate::supervisor::{SupervisorConfig, TunnelState, TunnelSupervisor};

/// Snapshot of both tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub main_running: bool,
    pub temporary_running: bool,
    pub main_pid: Option<u32>,
    pub temporary_pid: Option<u32>,
    pub main_state: TunnelState,
    pub temporary_state: TunnelState,
}

/// What a main-rules save (or reset) did to the running tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Rules equal the previous ones; nothing registered or restarted
    Unchanged,
    /// New configuration installed, running client restarted
    Restarted { pid: u32 },
    /// New configuration installed, stopped client started
    Started { pid: u32 },
    /// Rules persisted but there is no configuration to run yet
    Saved,
}

/// Result of a temporary-rules save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporaryOutcome {
    Unchanged,
    Enabled { visitor_code: Option<String> },
    Replaced { visitor_code: Option<String> },
    Disabled,
}

/// Result of a drift check on the main tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    AlreadyConsistent,
    Reregistered,
}

/// Both halves of a tunnel lock, released together on drop
struct TunnelGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: TunnelLock,
}

/// Registration, configuration and process lifecycle for both tunnels
pub struct Controller {
    store: RuleStore,
    registrar: Arc<dyn Registrar>,
    main: TunnelSupervisor,
    temporary: TunnelSupervisor,
    main_lock: Mutex<()>,
    temporary_lock: Mutex<()>,
}

impl Controller {
    pub fn new(config: &EngineConfig, registrar: Arc<dyn Registrar>) -> Result<Self> {
        let store = RuleStore::new(config.layout(), config.defaults_dir.clone())?;
        Ok(Self {
            store,
            registrar,
            main: TunnelSupervisor::new(SupervisorConfig::for_tunnel(config, RuleSetKind::Main)),
            temporary: TunnelSupervisor::new(SupervisorConfig::for_tunnel(
                config,
                RuleSetKind::Temporary,
            )),
            main_lock: Mutex::new(()),
            temporary_lock: Mutex::new(()),
        })
    }

    /// Controller talking to the configured cloud endpoints
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(StaticIdentity::from_config(&config.identity));
        Self::with_identity(config, identity)
    }

    pub fn with_identity(config: &EngineConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let registrar = CloudRegistrar::new(config.cloud.clone(), identity)?;
        Self::new(config, Arc::new(registrar))
    }

    /// Serialize an operation on one tunnel against every other caller
    async fn lock(&self, kind: RuleSetKind) -> Result<TunnelGuard<'_>> {
        let local = match kind {
            RuleSetKind::Main => self.main_lock.lock().await,
            RuleSetKind::Temporary => self.temporary_lock.lock().await,
        };
        let file = TunnelLock::acquire(&self.store.layout().lock_file(kind)).await?;
        Ok(TunnelGuard {
            _local: local,
            _file: file,
        })
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn main_rules(&self) -> Result<Vec<ForwardingRule>> {
        self.store.load_rules(RuleSetKind::Main)
    }

    pub fn temporary_rules(&self) -> Result<Vec<ForwardingRule>> {
        self.store.load_rules(RuleSetKind::Temporary)
    }

    pub fn temporary_enabled(&self) -> Result<bool> {
        self.store.temporary_enabled()
    }

    pub fn visitor_code(&self) -> Result<Option<String>> {
        self.store.visitor_code()
    }

    pub async fn status(&self) -> Status {
        let main_pid = self.main.pid().await;
        let temporary_pid = self.temporary.pid().await;
        Status {
            main_running: main_pid.is_some(),
            temporary_running: temporary_pid.is_some(),
            main_pid,
            temporary_pid,
            main_state: self.main.state().await,
            temporary_state: self.temporary.state().await,
        }
    }

    /// Validate, persist and apply a new main rule list
    ///
    /// Registration and restart only happen when the normalized rules differ
    /// from the persisted ones.
    pub async fn save_main_rules(&self, rules: Vec<ForwardingRule>) -> Result<SaveOutcome> {
        let _guard = self.lock(RuleSetKind::Main).await?;

        validate_rules(RuleSetKind::Main, &rules, true)?;
        let rules = normalize_rules(RuleSetKind::Main, &rules);
        let previous = normalize_rules(RuleSetKind::Main, &self.store.load_rules(RuleSetKind::Main)?);

        if !self.store.has_rules(RuleSetKind::Main) || rules != previous {
            self.store.save_rules(RuleSetKind::Main, &rules)?;
            info!("Saved {} main rule(s)", rules.len());
        }

        if rules == previous {
            let installed = self.store.installed_config(RuleSetKind::Main)?;
            if drift::is_consistent(&rules, installed.as_deref()) {
                info!("Main rules unchanged, no restart needed");
                return Ok(SaveOutcome::Unchanged);
            }
        }

        self.register_and_install(RuleSetKind::Main, &rules).await?;
        self.apply_main().await
    }

    /// Validate and persist the temporary rules, then drive the tunnel
    /// through the enabled-flag transition
    pub async fn save_temporary_rules(
        &self,
        rules: Vec<ForwardingRule>,
        enabled: bool,
    ) -> Result<TemporaryOutcome> {
        let _guard = self.lock(RuleSetKind::Temporary).await?;

        validate_rules(RuleSetKind::Temporary, &rules, enabled)?;
        let rules = normalize_rules(RuleSetKind::Temporary, &rules);
        let previous = normalize_rules(
            RuleSetKind::Temporary,
            &self.store.load_rules(RuleSetKind::Temporary)?,
        );
        let was_enabled = self.store.temporary_enabled()?;

        self.store.save_rules(RuleSetKind::Temporary, &rules)?;

        match (was_enabled, enabled) {
            (false, true) => {
                info!("Enabling temporary tunnel");
                match self.bring_up_temporary(&rules, false).await {
                    Ok(visitor_code) => {
                        self.store.set_temporary_enabled(true)?;
                        Ok(TemporaryOutcome::Enabled { visitor_code })
                    }
                    Err(e) => {
                        error!("Failed to enable temporary tunnel: {}", e);
                        self.store.set_temporary_enabled(false)?;
                        Err(e)
                    }
                }
            }
            (true, false) => {
                info!("Disabling temporary tunnel");
                self.store.set_temporary_enabled(false)?;
                self.tear_down_temporary().await?;
                Ok(TemporaryOutcome::Disabled)
            }
            (true, true) => {
                if rules != previous {
                    info!("Temporary rules changed, replacing tunnel");
                } else if !self.temporary_in_sync(&rules).await? {
                    info!("Temporary tunnel out of date, replacing it");
                } else {
                    return Ok(TemporaryOutcome::Unchanged);
                }
                let visitor_code = self.bring_up_temporary(&rules, true).await?;
                Ok(TemporaryOutcome::Replaced { visitor_code })
            }
            (false, false) => {
                self.store.set_temporary_enabled(false)?;
                if self.temporary_leftovers().await {
                    info!("Temporary tunnel disabled but not cleaned up, cleaning up");
                    self.tear_down_temporary().await?;
                    return Ok(TemporaryOutcome::Disabled);
                }
                Ok(TemporaryOutcome::Unchanged)
            }
        }
    }

    /// Re-register the main tunnel if the installed configuration has
    /// fallen behind the declared rules
    pub async fn ensure_consistent(&self) -> Result<Consistency> {
        let _guard = self.lock(RuleSetKind::Main).await?;
        self.ensure_consistent_locked().await
    }

    pub async fn start(&self) -> Result<u32> {
        let _guard = self.lock(RuleSetKind::Main).await?;
        self.preflight().await?;
        let pid = self.main.start().await?;
        self.store.set_main_held(false)?;
        Ok(pid)
    }

    /// Stop the main tunnel and keep it down until it is started again
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lock(RuleSetKind::Main).await?;
        self.store.set_main_held(true)?;
        self.main.stop().await
    }

    pub async fn restart(&self) -> Result<u32> {
        let _guard = self.lock(RuleSetKind::Main).await?;
        self.preflight().await?;
        let pid = self.main.restart().await?;
        self.store.set_main_held(false)?;
        Ok(pid)
    }

    /// Start the main tunnel again if it died on its own
    ///
    /// Does nothing while it runs, while it was stopped on request or while
    /// no configuration is installed. Returns the PID of a revived client.
    pub async fn revive_main(&self) -> Result<Option<u32>> {
        let _guard = self.lock(RuleSetKind::Main).await?;
        if self.store.main_held()
            || !self.store.has_installed_config(RuleSetKind::Main)
            || self.main.is_running().await
        {
            return Ok(None);
        }

        warn!("Main tunnel is not running, starting it");
        self.preflight().await?;
        self.main.start().await.map(Some)
    }

    /// Startup sequence for a long-running engine
    ///
    /// Adopts clients left by a previous instance, registers the main tunnel
    /// if no configuration was ever installed, then starts it. Returns the
    /// main client's PID when it ends up running.
    pub async fn bootstrap(&self) -> Result<Option<u32>> {
        {
            let _guard = self.lock(RuleSetKind::Temporary).await?;
            if let Some(pid) = self.temporary.adopt().await? {
                info!("Temporary tunnel already running (PID: {})", pid);
            }
        }

        let _guard = self.lock(RuleSetKind::Main).await?;
        self.main.adopt().await?;

        if !self.store.has_installed_config(RuleSetKind::Main) {
            info!("No main configuration installed, registering");
            if let Err(e) = self.ensure_consistent_locked().await {
                warn!("Registration failed, waiting for configuration: {}", e);
                return Ok(None);
            }
        }

        if !self.store.has_installed_config(RuleSetKind::Main) {
            info!("Waiting for configuration");
            return Ok(None);
        }

        let pid = self.main.start().await?;
        self.store.set_main_held(false)?;
        Ok(Some(pid))
    }

    /// Replace the main rules with the shipped template and apply them
    pub async fn reset_main_rules(&self) -> Result<SaveOutcome> {
        let _guard = self.lock(RuleSetKind::Main).await?;

        let rules = normalize_rules(
            RuleSetKind::Main,
            &self
                .store
                .template_rules(RuleSetKind::Main)?
                .unwrap_or_default(),
        );
        self.store.save_rules(RuleSetKind::Main, &rules)?;
        info!("Reset main rules to {} default rule(s)", rules.len());

        if !rules.is_empty() {
            self.register_and_install(RuleSetKind::Main, &rules).await?;
        }

        if !self.store.has_installed_config(RuleSetKind::Main) {
            return Ok(SaveOutcome::Saved);
        }
        self.apply_main().await
    }

    /// Replace the temporary rules with the shipped template
    pub async fn reset_temporary_rules(&self) -> Result<Vec<ForwardingRule>> {
        let _guard = self.lock(RuleSetKind::Temporary).await?;

        let rules = normalize_rules(
            RuleSetKind::Temporary,
            &self
                .store
                .template_rules(RuleSetKind::Temporary)?
                .unwrap_or_default(),
        );
        self.store.save_rules(RuleSetKind::Temporary, &rules)?;
        info!("Reset temporary rules to {} default rule(s)", rules.len());
        Ok(rules)
    }

    async fn ensure_consistent_locked(&self) -> Result<Consistency> {
        let rules = normalize_rules(RuleSetKind::Main, &self.store.load_rules(RuleSetKind::Main)?);
        let installed = self.store.installed_config(RuleSetKind::Main)?;

        if drift::is_consistent(&rules, installed.as_deref()) {
            return Ok(Consistency::AlreadyConsistent);
        }

        info!("Main configuration out of date, re-registering");
        self.register_and_install(RuleSetKind::Main, &rules).await?;
        Ok(Consistency::Reregistered)
    }

    /// Drift check before start/restart
    ///
    /// A failed re-registration is fatal only when there is no installed
    /// configuration to fall back on.
    async fn preflight(&self) -> Result<()> {
        match self.ensure_consistent_locked().await {
            Ok(_) => Ok(()),
            Err(e) if self.store.has_installed_config(RuleSetKind::Main) => {
                warn!("Re-registration failed, starting with installed configuration: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn register_and_install(
        &self,
        kind: RuleSetKind,
        rules: &[ForwardingRule],
    ) -> Result<Option<String>> {
        let registration = self.registrar.register(kind, rules).await?;
        self.store.install_config(kind, &registration.config_text)?;
        info!("Installed {} tunnel configuration", kind);
        Ok(registration.visitor_code)
    }

    async fn apply_main(&self) -> Result<SaveOutcome> {
        let outcome = if self.main.is_running().await {
            let pid = self.main.restart().await?;
            SaveOutcome::Restarted { pid }
        } else {
            let pid = self.main.start().await?;
            SaveOutcome::Started { pid }
        };
        self.store.set_main_held(false)?;
        Ok(outcome)
    }

    /// Whether the enabled temporary tunnel runs the config its rules need
    async fn temporary_in_sync(&self, rules: &[ForwardingRule]) -> Result<bool> {
        let installed = self.store.installed_config(RuleSetKind::Temporary)?;
        Ok(installed.is_some()
            && drift::is_consistent(rules, installed.as_deref())
            && self.temporary.is_running().await)
    }

    /// Anything a disabled temporary tunnel should not have left behind
    async fn temporary_leftovers(&self) -> bool {
        let layout = self.store.layout();
        self.temporary.is_running().await
            || layout.pid_file(RuleSetKind::Temporary).exists()
            || layout.generated_config(RuleSetKind::Temporary).exists()
            || layout.visitor_code().exists()
    }

    async fn tear_down_temporary(&self) -> Result<()> {
        self.temporary
            .cleanup(&[self.store.layout().visitor_code()])
            .await
    }

    /// Register, install, record the visitor code and (re)start the client
    async fn bring_up_temporary(
        &self,
        rules: &[ForwardingRule],
        replace: bool,
    ) -> Result<Option<String>> {
        let visitor_code = self
            .register_and_install(RuleSetKind::Temporary, rules)
            .await?;

        match &visitor_code {
            Some(code) => self.store.save_visitor_code(code)?,
            None => self.store.clear_visitor_code()?,
        }

        let started = if replace {
            self.temporary.restart().await
        } else {
            self.temporary.start().await
        };

        if let Err(e) = started {
            if !replace {
                if let Err(cleanup_err) = self.tear_down_temporary().await {
                    warn!("Cleanup after failed start also failed: {}", cleanup_err);
                }
            }
            return Err(e);
        }

        Ok(visitor_code)
    }
}
