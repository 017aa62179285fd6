//! Human-readable rendering of engine state

use tunnelward_engine::{ForwardingRule, RuleSetKind, SaveOutcome, Status, TemporaryOutcome, TunnelState};

fn state_label(state: TunnelState) -> &'static str {
    match state {
        TunnelState::Stopped => "stopped",
        TunnelState::Starting => "starting",
        TunnelState::Running => "running",
        TunnelState::Stopping => "stopping",
    }
}

fn tunnel_line(name: &str, state: TunnelState, pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("  {:<10} {} (PID: {})", name, state_label(state), pid),
        None => format!("  {:<10} {}", name, state_label(state)),
    }
}

pub fn format_status(status: &Status) -> String {
    [
        "Tunnels".to_string(),
        tunnel_line("main", status.main_state, status.main_pid),
        tunnel_line("temporary", status.temporary_state, status.temporary_pid),
    ]
    .join("\n")
}

pub fn format_rules(kind: RuleSetKind, rules: &[ForwardingRule]) -> String {
    if rules.is_empty() {
        return format!("No {} rules configured", kind);
    }

    let mut lines = vec![
        format!("{} rules ({})", capitalize(kind.as_str()), rules.len()),
        format!("  {:<20} {:>6} {:>6}  {}", "SERVICE", "LOCAL", "BIND", "LINK"),
    ];
    for rule in rules {
        let bind = rule
            .bind_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "random".to_string());
        lines.push(format!(
            "  {:<20} {:>6} {:>6}  {}",
            rule.service_name,
            rule.local_port,
            bind,
            if rule.link { "yes" } else { "no" }
        ));
    }
    lines.join("\n")
}

pub fn describe_save(outcome: &SaveOutcome) -> String {
    match outcome {
        SaveOutcome::Unchanged => "Rules unchanged, tunnel left as is".to_string(),
        SaveOutcome::Restarted { pid } => format!("Configuration updated, tunnel restarted (PID: {})", pid),
        SaveOutcome::Started { pid } => format!("Configuration updated, tunnel started (PID: {})", pid),
        SaveOutcome::Saved => "Rules saved, waiting for configuration".to_string(),
    }
}

pub fn describe_temporary(outcome: &TemporaryOutcome) -> String {
    match outcome {
        TemporaryOutcome::Unchanged => "Temporary tunnel unchanged".to_string(),
        TemporaryOutcome::Enabled { visitor_code } => {
            format!("Temporary tunnel enabled{}", code_suffix(visitor_code.as_deref()))
        }
        TemporaryOutcome::Replaced { visitor_code } => {
            format!("Temporary tunnel replaced{}", code_suffix(visitor_code.as_deref()))
        }
        TemporaryOutcome::Disabled => "Temporary tunnel disabled".to_string(),
    }
}

fn code_suffix(code: Option<&str>) -> String {
    code.map(|c| format!(", visitor code: {}", c))
        .unwrap_or_default()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
