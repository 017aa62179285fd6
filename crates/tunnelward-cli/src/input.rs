//! Rule lists as typed on the command line or supplied as JSON files

use anyhow::{Context, Result};
use std::path::Path;
use tunnelward_engine::rules::parse_rule_spec;
use tunnelward_engine::ForwardingRule;

/// Parse `name:port[:bind]` specs, in order
pub fn parse_rule_specs(specs: &[String]) -> Result<Vec<ForwardingRule>> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            parse_rule_spec(index, spec).with_context(|| format!("Invalid rule '{}'", spec))
        })
        .collect()
}

/// Read a JSON rule document in the same shape the engine persists
pub fn read_rules_file(path: &Path) -> Result<Vec<ForwardingRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules from {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse rules in {:?}", path))
}

/// Rules from `--file` if given, otherwise from the `--rule` specs
pub fn collect_rules(specs: &[String], file: Option<&Path>) -> Result<Vec<ForwardingRule>> {
    match file {
        Some(path) => read_rules_file(path),
        None => parse_rule_specs(specs),
    }
}
