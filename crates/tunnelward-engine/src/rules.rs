//! Forwarding rules and rule-set validation

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bind_port::{self, BindPort};
use crate::error::ValidationError;

/// Maximum number of services in a single rule list
pub const MAX_RULES: usize = 10;

/// Which of the two tunnels a rule list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleSetKind {
    /// Long-lived tunnel
    Main,
    /// Ephemeral remote-assistance tunnel
    Temporary,
}

impl RuleSetKind {
    /// Bind-port prefix; the two sets never collide because these differ
    pub fn prefix(self) -> u8 {
        match self {
            RuleSetKind::Main => 3,
            RuleSetKind::Temporary => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleSetKind::Main => "main",
            RuleSetKind::Temporary => "temporary",
        }
    }
}

impl fmt::Display for RuleSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single local service exposed through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub service_name: String,
    #[serde(with = "port_value")]
    pub local_port: u16,
    /// Relay port; `None` asks the backend for a random one
    #[serde(default, with = "optional_port_value")]
    pub bind_port: Option<u16>,
    #[serde(default = "default_link")]
    pub link: bool,
}

fn default_link() -> bool {
    true
}

impl ForwardingRule {
    pub fn new(service_name: impl Into<String>, local_port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            local_port,
            bind_port: None,
            link: bind_port::link_value(local_port),
        }
    }

    /// Fill in the deterministic bind port and recompute the link hint
    ///
    /// A caller-supplied bind port survives only when the allocator falls
    /// back to random assignment.
    pub fn normalized(&self, kind: RuleSetKind) -> Self {
        let bind_port = match bind_port::assign(self.local_port, kind.prefix()) {
            BindPort::Fixed(port) => Some(port),
            BindPort::Random => self.bind_port.filter(|p| *p != 0),
        };

        Self {
            service_name: self.service_name.trim().to_string(),
            local_port: self.local_port,
            bind_port,
            link: bind_port::link_value(self.local_port),
        }
    }
}

/// Parse a user-supplied local port
pub fn parse_local_port(index: usize, value: &str) -> Result<u16, ValidationError> {
    match value.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(ValidationError::InvalidLocalPort {
            index,
            value: value.to_string(),
        }),
    }
}

/// Parse a `name:port[:bind]` rule spec as accepted on the command line
pub fn parse_rule_spec(index: usize, spec: &str) -> Result<ForwardingRule, ValidationError> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or_default().trim();
    let port = parts.next().unwrap_or_default();

    if name.is_empty() {
        return Err(ValidationError::EmptyServiceName { index });
    }

    let mut rule = ForwardingRule::new(name, parse_local_port(index, port)?);
    if let Some(bind) = parts.next() {
        rule.bind_port = Some(parse_local_port(index, bind)?);
    }
    Ok(rule)
}

/// Check a rule list against the size and shape limits
///
/// `enabled` only matters for the temporary list, which may be empty while
/// the temporary tunnel is off.
pub fn validate_rules(
    kind: RuleSetKind,
    rules: &[ForwardingRule],
    enabled: bool,
) -> Result<(), ValidationError> {
    if rules.is_empty() {
        match kind {
            RuleSetKind::Main => return Err(ValidationError::EmptyMainRules),
            RuleSetKind::Temporary if enabled => {
                return Err(ValidationError::EmptyTemporaryRules)
            }
            RuleSetKind::Temporary => {}
        }
    }

    if rules.len() > MAX_RULES {
        return Err(ValidationError::TooManyRules {
            max: MAX_RULES,
            count: rules.len(),
        });
    }

    for (index, rule) in rules.iter().enumerate() {
        if rule.service_name.trim().is_empty() {
            return Err(ValidationError::EmptyServiceName { index });
        }
        if rule.local_port == 0 {
            return Err(ValidationError::InvalidLocalPort {
                index,
                value: rule.local_port.to_string(),
            });
        }
    }

    Ok(())
}

/// Normalize every rule of a list for `kind`
pub fn normalize_rules(kind: RuleSetKind, rules: &[ForwardingRule]) -> Vec<ForwardingRule> {
    rules.iter().map(|r| r.normalized(kind)).collect()
}

/// Ports may arrive as numbers or numeric strings
mod port_value {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum RawPort {
        Number(u64),
        Text(String),
    }

    impl RawPort {
        pub(super) fn into_u64(self) -> Result<Option<u64>, String> {
            match self {
                RawPort::Number(n) => Ok(Some(n)),
                RawPort::Text(s) if s.trim().is_empty() => Ok(None),
                RawPort::Text(s) => s
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| format!("invalid port {:?}", s)),
            }
        }
    }

    pub fn serialize<S>(port: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(*port)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = RawPort::deserialize(deserializer)?
            .into_u64()
            .map_err(D::Error::custom)?
            .ok_or_else(|| D::Error::custom("missing port"))?;
        u16::try_from(value).map_err(|_| D::Error::custom(format!("port {} out of range", value)))
    }
}

/// Legacy documents store `0` or `""` for "no bind port"
mod optional_port_value {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::port_value::RawPort;

    pub fn serialize<S>(port: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match port {
            Some(port) => serializer.serialize_u16(*port),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<RawPort>::deserialize(deserializer)? else {
            return Ok(None);
        };
        match raw.into_u64().map_err(D::Error::custom)? {
            None | Some(0) => Ok(None),
            Some(value) => u16::try_from(value)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("port {} out of range", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_assigns_bind_port_and_link() {
        let rule = ForwardingRule {
            service_name: " ssh ".to_string(),
            local_port: 22,
            bind_port: None,
            link: true,
        };
        let normalized = rule.normalized(RuleSetKind::Main);
        assert_eq!(normalized.service_name, "ssh");
        assert_eq!(normalized.bind_port, Some(30022));
        assert!(!normalized.link);

        let temp = ForwardingRule::new("web", 8080).normalized(RuleSetKind::Temporary);
        assert_eq!(temp.bind_port, Some(48080));
        assert!(temp.link);
    }

    #[test]
    fn test_normalize_keeps_supplied_port_when_random() {
        let mut rule = ForwardingRule::new("db", 15432);
        assert_eq!(rule.normalized(RuleSetKind::Main).bind_port, None);

        rule.bind_port = Some(35432);
        assert_eq!(rule.normalized(RuleSetKind::Main).bind_port, Some(35432));
    }

    #[test]
    fn test_normalize_overrides_supplied_deterministic_port() {
        let mut rule = ForwardingRule::new("web", 8080);
        rule.bind_port = Some(12345);
        assert_eq!(rule.normalized(RuleSetKind::Main).bind_port, Some(38080));
    }

    #[test]
    fn test_validate_limits() {
        assert_eq!(
            validate_rules(RuleSetKind::Main, &[], false),
            Err(ValidationError::EmptyMainRules)
        );
        assert!(validate_rules(RuleSetKind::Temporary, &[], false).is_ok());
        assert_eq!(
            validate_rules(RuleSetKind::Temporary, &[], true),
            Err(ValidationError::EmptyTemporaryRules)
        );

        let eleven: Vec<_> = (0..11)
            .map(|i| ForwardingRule::new(format!("svc{}", i), 8000 + i))
            .collect();
        assert_eq!(
            validate_rules(RuleSetKind::Main, &eleven, false),
            Err(ValidationError::TooManyRules { max: 10, count: 11 })
        );
        assert!(validate_rules(RuleSetKind::Main, &eleven[..10], false).is_ok());
    }

    #[test]
    fn test_validate_rule_shape() {
        let rules = vec![ForwardingRule::new("ok", 80), ForwardingRule::new("  ", 81)];
        assert_eq!(
            validate_rules(RuleSetKind::Main, &rules, false),
            Err(ValidationError::EmptyServiceName { index: 1 })
        );

        let rules = vec![ForwardingRule::new("zero", 0)];
        assert!(matches!(
            validate_rules(RuleSetKind::Main, &rules, false),
            Err(ValidationError::InvalidLocalPort { index: 0, .. })
        ));
    }

    #[test]
    fn test_parse_local_port() {
        assert_eq!(parse_local_port(0, "22"), Ok(22));
        assert_eq!(parse_local_port(0, " 8080 "), Ok(8080));
        assert!(parse_local_port(0, "0").is_err());
        assert!(parse_local_port(0, "65536").is_err());
        assert!(parse_local_port(2, "ssh").is_err());
    }

    #[test]
    fn test_parse_rule_spec() {
        let rule = parse_rule_spec(0, "ssh:22").unwrap();
        assert_eq!(rule, ForwardingRule::new("ssh", 22));
        assert!(!rule.link);

        let rule = parse_rule_spec(0, "grafana:13000:33000").unwrap();
        assert_eq!(rule.bind_port, Some(33000));

        assert!(parse_rule_spec(0, ":22").is_err());
        assert!(parse_rule_spec(0, "web").is_err());
        assert!(parse_rule_spec(0, "web:http").is_err());
    }

    #[test]
    fn test_deserialize_legacy_document() {
        let json = r#"[
            {"serviceName": "SSH", "localPort": 22, "bindPort": 30022, "link": false},
            {"serviceName": "Web", "localPort": "8123", "bindPort": 0},
            {"serviceName": "Big", "localPort": 18080, "bindPort": null},
            {"serviceName": "Text", "localPort": 81, "bindPort": ""}
        ]"#;
        let rules: Vec<ForwardingRule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].bind_port, Some(30022));
        assert_eq!(rules[1].local_port, 8123);
        assert_eq!(rules[1].bind_port, None);
        assert!(rules[1].link);
        assert_eq!(rules[2].bind_port, None);
        assert_eq!(rules[3].bind_port, None);
    }

    #[test]
    fn test_deserialize_rejects_bad_port() {
        let json = r#"[{"serviceName": "x", "localPort": "abc"}]"#;
        assert!(serde_json::from_str::<Vec<ForwardingRule>>(json).is_err());
        let json = r#"[{"serviceName": "x", "localPort": 70000}]"#;
        assert!(serde_json::from_str::<Vec<ForwardingRule>>(json).is_err());
    }

    #[test]
    fn test_serialize_camel_case() {
        let rule = ForwardingRule::new("ssh", 22).normalized(RuleSetKind::Main);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "serviceName": "ssh",
                "localPort": 22,
                "bindPort": 30022,
                "link": false
            })
        );
    }
}
