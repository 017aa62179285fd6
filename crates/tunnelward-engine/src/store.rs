//! Rule store
//!
//! Persists the two rule lists, the temporary-tunnel flag, the visitor code
//! and the installed generated configurations as plain files under the
//! service directory. Every write replaces the target atomically.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{rules_file_name, Layout};
use crate::error::{EngineError, Result};
use crate::rules::{ForwardingRule, RuleSetKind};

/// File-backed store for rules and generated artifacts
#[derive(Debug, Clone)]
pub struct RuleStore {
    layout: Layout,
    defaults_dir: Option<PathBuf>,
}

impl RuleStore {
    /// Create a store rooted at the layout's service directory
    pub fn new(layout: Layout, defaults_dir: Option<PathBuf>) -> Result<Self> {
        fs::create_dir_all(&layout.service_dir)
            .map_err(|e| EngineError::storage(&layout.service_dir, e))?;
        Ok(Self {
            layout,
            defaults_dir,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Load a rule list: persisted document, else template, else empty
    pub fn load_rules(&self, kind: RuleSetKind) -> Result<Vec<ForwardingRule>> {
        let path = self.layout.rules(kind);
        if let Some(rules) = read_rules(&path)? {
            return Ok(rules);
        }
        Ok(self.template_rules(kind)?.unwrap_or_default())
    }

    /// Template rule list shipped in the defaults directory, if any
    pub fn template_rules(&self, kind: RuleSetKind) -> Result<Option<Vec<ForwardingRule>>> {
        match &self.defaults_dir {
            Some(dir) => read_rules(&dir.join(rules_file_name(kind))),
            None => Ok(None),
        }
    }

    /// Whether a rule document has been persisted (templates don't count)
    pub fn has_rules(&self, kind: RuleSetKind) -> bool {
        self.layout.rules(kind).exists()
    }

    pub fn save_rules(&self, kind: RuleSetKind, rules: &[ForwardingRule]) -> Result<()> {
        let path = self.layout.rules(kind);
        let json = serde_json::to_string_pretty(rules).map_err(|e| {
            EngineError::storage(&path, std::io::Error::new(ErrorKind::InvalidData, e))
        })?;
        write_atomic(&path, json.as_bytes())
    }

    /// Temporary-tunnel enabled flag; missing file means disabled
    pub fn temporary_enabled(&self) -> Result<bool> {
        Ok(read_text(&self.layout.temporary_flag())?
            .map(|s| s.trim() == "true")
            .unwrap_or(false))
    }

    pub fn set_temporary_enabled(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "true" } else { "false" };
        write_atomic(&self.layout.temporary_flag(), value.as_bytes())
    }

    /// Current visitor code; empty or missing file means none
    pub fn visitor_code(&self) -> Result<Option<String>> {
        Ok(read_text(&self.layout.visitor_code())?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub fn save_visitor_code(&self, code: &str) -> Result<()> {
        write_atomic(&self.layout.visitor_code(), code.as_bytes())
    }

    pub fn clear_visitor_code(&self) -> Result<()> {
        remove_if_exists(&self.layout.visitor_code())
    }

    /// Whether the main tunnel was stopped on request and should stay down
    pub fn main_held(&self) -> bool {
        self.layout.stop_marker().exists()
    }

    pub fn set_main_held(&self, held: bool) -> Result<()> {
        if held {
            write_atomic(&self.layout.stop_marker(), b"stopped")
        } else {
            remove_if_exists(&self.layout.stop_marker())
        }
    }

    /// The generated configuration currently installed for a tunnel
    pub fn installed_config(&self, kind: RuleSetKind) -> Result<Option<String>> {
        read_text(&self.layout.generated_config(kind))
    }

    pub fn has_installed_config(&self, kind: RuleSetKind) -> bool {
        self.layout.generated_config(kind).exists()
    }

    /// Replace the installed configuration wholesale
    pub fn install_config(&self, kind: RuleSetKind, text: &str) -> Result<()> {
        write_atomic(&self.layout.generated_config(kind), text.as_bytes())
    }

    pub fn remove_installed_config(&self, kind: RuleSetKind) -> Result<()> {
        remove_if_exists(&self.layout.generated_config(kind))
    }
}

fn read_rules(path: &Path) -> Result<Option<Vec<ForwardingRule>>> {
    let Some(json) = read_text(path)? else {
        return Ok(None);
    };
    if json.trim().is_empty() {
        return Ok(Some(Vec::new()));
    }
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| EngineError::storage(path, std::io::Error::new(ErrorKind::InvalidData, e)))
}

fn read_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::storage(path, e)),
    }
}

/// Write to a sibling temp file, sync, then rename over the target
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::storage(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let temp_path = path.with_file_name(format!(
        ".{}.{}-{}.tmp",
        file_name,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        EngineError::storage(path, e)
    })
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::storage(path, e)),
    }
}
