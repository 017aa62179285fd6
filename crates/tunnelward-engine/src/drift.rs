//! Drift detection between declared rules and the installed configuration
//!
//! The generated document belongs to the tunnel client, so it is scanned as
//! a black box: the only contract is that every exposed port appears as a
//! `remotePort = <digits>` assignment.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, warn};

use crate::rules::ForwardingRule;

/// Field token carrying the relay port in the generated configuration
pub const REMOTE_PORT_TOKEN: &str = "remotePort";

fn remote_port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"{}\s*=\s*(\d+)", REMOTE_PORT_TOKEN)).expect("valid regex")
    })
}

/// Relay ports the rules expect to find installed
pub fn expected_ports(rules: &[ForwardingRule]) -> BTreeSet<u16> {
    rules.iter().filter_map(|r| r.bind_port).collect()
}

/// Relay ports actually present in a generated configuration
pub fn remote_ports(config_text: &str) -> BTreeSet<u16> {
    remote_port_pattern()
        .captures_iter(config_text)
        .filter_map(|cap| cap[1].parse::<u16>().ok())
        .collect()
}

/// Whether every declared bind port is present in the installed document
///
/// A missing document is always inconsistent. Extra ports in the document
/// are fine; it may carry defaults of its own.
pub fn is_consistent(rules: &[ForwardingRule], installed: Option<&str>) -> bool {
    let Some(config_text) = installed else {
        debug!("No installed configuration, treating as drifted");
        return false;
    };

    let expected = expected_ports(rules);
    if expected.is_empty() {
        return true;
    }

    let actual = remote_ports(config_text);
    let consistent = expected.is_subset(&actual);
    if !consistent {
        warn!(
            "Configuration drift detected. Expected: {:?}, Actual: {:?}",
            expected, actual
        );
    }
    consistent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_with_bind(port: u16) -> ForwardingRule {
        ForwardingRule {
            service_name: format!("svc-{}", port),
            local_port: 80,
            bind_port: Some(port),
            link: true,
        }
    }

    const INSTALLED: &str = r#"
serverAddr = "relay.example.com"
serverPort = 7000

[[proxies]]
name = "ssh"
type = "tcp"
localIP = "127.0.0.1"
localPort = 22
remotePort = 30022

[[proxies]]
name = "web"
type = "tcp"
localIP = "127.0.0.1"
localPort = 8080
remotePort=38080
"#;

    #[test]
    fn test_remote_ports_scan() {
        let ports = remote_ports(INSTALLED);
        assert_eq!(ports, BTreeSet::from([30022, 38080]));
    }

    #[test]
    fn test_subset_is_consistent() {
        assert!(is_consistent(&[rule_with_bind(30022)], Some(INSTALLED)));
        assert!(is_consistent(
            &[rule_with_bind(30022), rule_with_bind(38080)],
            Some(INSTALLED)
        ));
    }

    #[test]
    fn test_missing_port_is_drift() {
        assert!(!is_consistent(
            &[rule_with_bind(30022), rule_with_bind(49999)],
            Some(INSTALLED)
        ));
    }

    #[test]
    fn test_missing_config_is_drift() {
        assert!(!is_consistent(&[rule_with_bind(30022)], None));
        assert!(!is_consistent(&[], None));
    }

    #[test]
    fn test_nothing_expected_is_consistent() {
        let random_only = ForwardingRule::new("big", 20000);
        assert!(is_consistent(&[random_only], Some("")));
        assert!(is_consistent(&[], Some(INSTALLED)));
    }

    #[test]
    fn test_other_port_fields_are_ignored() {
        let text = "serverPort = 30022\nlocalPort = 30022\n";
        assert!(remote_ports(text).is_empty());
        assert!(!is_consistent(&[rule_with_bind(30022)], Some(text)));
    }

    #[test]
    fn test_out_of_range_values_are_skipped() {
        assert!(remote_ports("remotePort = 99999").is_empty());
    }
}
