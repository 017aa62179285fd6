//! Engine configuration
//!
//! Loaded from a YAML file (default `~/.tunnelward/config.yml`). Every field
//! has a default so a missing file yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::rules::RuleSetKind;

/// Default persistent registration endpoint
pub const DEFAULT_PROXY_URL: &str = "https://euadmin.linklinkiot.com/frpserver/api/proxy";

/// Default ephemeral registration endpoint
pub const DEFAULT_TMP_PROXY_URL: &str = "https://euadmin.linklinkiot.com/frpserver/api/tmp-proxy";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding rule documents, generated configs, PID and log files
    #[serde(default = "default_service_dir")]
    pub service_dir: PathBuf,

    /// Directory with template rule documents used when none are persisted
    #[serde(default)]
    pub defaults_dir: Option<PathBuf>,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Cloud registration endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,

    #[serde(default = "default_tmp_proxy_url")]
    pub tmp_proxy_url: String,

    /// Registration request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Static cloud identity (supports ${ENV_VAR} expansion)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub company_id: Option<String>,
    pub user_id: Option<String>,
}

/// Tunnel client process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Ordered binary search path; empty means the built-in list
    #[serde(default)]
    pub binary_paths: Vec<PathBuf>,

    /// Name looked up on `$PATH` after `binary_paths` is exhausted
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Pause between stop and start on restart
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,
}

fn default_service_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tunnelward")
}

fn default_proxy_url() -> String {
    DEFAULT_PROXY_URL.to_string()
}

fn default_tmp_proxy_url() -> String {
    DEFAULT_TMP_PROXY_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_binary_name() -> String {
    "frpc".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_restart_pause_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_dir: default_service_dir(),
            defaults_dir: None,
            cloud: CloudConfig::default(),
            identity: IdentityConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            tmp_proxy_url: default_tmp_proxy_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary_paths: Vec::new(),
            binary_name: default_binary_name(),
            stop_timeout_ms: default_stop_timeout_ms(),
            restart_pause_ms: default_restart_pause_ms(),
        }
    }
}

impl CloudConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn endpoint(&self, kind: RuleSetKind) -> &str {
        match kind {
            RuleSetKind::Main => &self.proxy_url,
            RuleSetKind::Temporary => &self.tmp_proxy_url,
        }
    }
}

impl ClientConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl EngineConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        default_service_dir().join("config.yml")
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default().with_env_expanded())
            }
            Err(e) => return Err(EngineError::storage(path, e)),
        };

        Self::from_yaml(&content)
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {}", e)))?;
        Ok(config.with_env_expanded())
    }

    /// Expand `${VAR}` references in identity fields
    fn with_env_expanded(mut self) -> Self {
        self.identity.company_id = self.identity.company_id.map(|v| expand_env_vars(&v));
        self.identity.user_id = self.identity.user_id.map(|v| expand_env_vars(&v));
        self
    }

    /// Ordered search path for the tunnel client binary
    pub fn binary_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = if self.client.binary_paths.is_empty() {
            vec![
                self.service_dir.join("bin").join(&self.client.binary_name),
                PathBuf::from("/usr/local/bin").join(&self.client.binary_name),
                PathBuf::from("/usr/bin").join(&self.client.binary_name),
            ]
        } else {
            self.client.binary_paths.clone()
        };

        if let Some(path_var) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join(&self.client.binary_name);
                if !paths.contains(&candidate) {
                    paths.push(candidate);
                }
            }
        }

        paths
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.service_dir)
    }
}

/// Well-known file locations under the service directory
#[derive(Debug, Clone)]
pub struct Layout {
    pub service_dir: PathBuf,
}

impl Layout {
    pub fn new(service_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_dir: service_dir.into(),
        }
    }

    /// Persisted rule document for a rule set
    pub fn rules(&self, kind: RuleSetKind) -> PathBuf {
        self.service_dir.join(rules_file_name(kind))
    }

    /// Generated tunnel client configuration
    pub fn generated_config(&self, kind: RuleSetKind) -> PathBuf {
        self.service_dir.join(match kind {
            RuleSetKind::Main => "frpc.toml",
            RuleSetKind::Temporary => "frpc_tmp.toml",
        })
    }

    pub fn pid_file(&self, kind: RuleSetKind) -> PathBuf {
        self.service_dir.join(match kind {
            RuleSetKind::Main => "frpc.pid",
            RuleSetKind::Temporary => "frpc_tmp.pid",
        })
    }

    pub fn log_file(&self, kind: RuleSetKind) -> PathBuf {
        self.service_dir.join(match kind {
            RuleSetKind::Main => "frpc.log",
            RuleSetKind::Temporary => "frpc_tmp.log",
        })
    }

    /// Lock file serializing operations on a tunnel across processes
    pub fn lock_file(&self, kind: RuleSetKind) -> PathBuf {
        self.service_dir.join(match kind {
            RuleSetKind::Main => "frpc.lock",
            RuleSetKind::Temporary => "frpc_tmp.lock",
        })
    }

    /// Present while the main tunnel was stopped on request
    pub fn stop_marker(&self) -> PathBuf {
        self.service_dir.join("frpc.stopped")
    }

    /// Temporary-tunnel enabled flag
    pub fn temporary_flag(&self) -> PathBuf {
        self.service_dir.join("remote_assistance")
    }

    pub fn visitor_code(&self) -> PathBuf {
        self.service_dir.join("visitor_code")
    }
}

/// File name of the rule document, shared with the template directory
pub fn rules_file_name(kind: RuleSetKind) -> &'static str {
    match kind {
        RuleSetKind::Main => "register_proxy.json",
        RuleSetKind::Temporary => "register_proxy_tmp.json",
    }
}

/// Expand environment variables in the format ${VAR_NAME}
fn expand_env_vars(value: &str) -> String {
    let mut result = value.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").expect("valid regex");

    for cap in re.captures_iter(value) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
