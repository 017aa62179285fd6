//! Cloud registration
//!
//! Translates a rule list into the cloud API's proxy array, posts it to the
//! persistent or ephemeral endpoint, and hands back the generated tunnel
//! client configuration (plus a visitor code for ephemeral registrations).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CloudConfig;
use crate::error::{EngineError, RegistrationError, Result};
use crate::identity::IdentityProvider;
use crate::rules::{ForwardingRule, RuleSetKind};

/// Address every proxied service is reached on from the tunnel client
pub const LOCAL_IP: &str = "127.0.0.1";

/// One entry of the cloud API's proxy array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProxy {
    pub local_ip: String,
    pub local_port: String,
    pub remote_port: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
}

/// Successful registration result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Opaque tunnel client configuration, installed verbatim
    pub config_text: String,
    /// Access code, only issued for the temporary tunnel
    pub visitor_code: Option<String>,
}

/// Registers rule lists with the cloud
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, kind: RuleSetKind, rules: &[ForwardingRule]) -> Result<Registration>;
}

/// Remote port that asks the backend to pick a free relay port
pub const RANDOM_REMOTE_PORT: &str = "0";

/// Convert rules into the cloud wire shape
///
/// Rules without a bind port are sent with remote port `0` so the backend
/// allocates one. Rules without a local port cannot be forwarded and are
/// dropped rather than failing the whole batch.
pub fn translate(rules: &[ForwardingRule]) -> Vec<CloudProxy> {
    rules
        .iter()
        .filter_map(|rule| {
            if rule.local_port == 0 {
                debug!(
                    "Dropping '{}' from registration payload: no local port",
                    rule.service_name
                );
                return None;
            }
            let remote_port = match rule.bind_port.filter(|p| *p != 0) {
                Some(port) => port.to_string(),
                None => RANDOM_REMOTE_PORT.to_string(),
            };
            Some(CloudProxy {
                local_ip: LOCAL_IP.to_string(),
                local_port: rule.local_port.to_string(),
                remote_port,
                proxy_type: "tcp".to_string(),
            })
        })
        .collect()
}

/// Response body of both registration endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudResponse {
    status: serde_json::Value,
    #[serde(default)]
    generated_config_text: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    visitor_code: Option<String>,
}

fn status_is_success(status: &serde_json::Value) -> bool {
    match status {
        serde_json::Value::Number(n) => n.as_i64() == Some(0),
        serde_json::Value::String(s) => s.trim() == "0",
        _ => false,
    }
}

/// Interpret a response body from a registration endpoint
pub fn parse_response(
    kind: RuleSetKind,
    body: &str,
) -> std::result::Result<Registration, RegistrationError> {
    let response: CloudResponse = serde_json::from_str(body)
        .map_err(|e| RegistrationError::MalformedBody(e.to_string()))?;

    if !status_is_success(&response.status) {
        let status = match &response.status {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(RegistrationError::Rejected {
            status,
            message: response.msg.unwrap_or_else(|| "no message".to_string()),
        });
    }

    let config_text = response
        .generated_config_text
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| {
            RegistrationError::MalformedBody("missing generatedConfigText".to_string())
        })?;

    let visitor_code = match kind {
        RuleSetKind::Main => None,
        RuleSetKind::Temporary => response
            .visitor_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
    };

    Ok(Registration {
        config_text,
        visitor_code,
    })
}

/// HTTP registrar talking to the cloud endpoints
pub struct CloudRegistrar {
    http: reqwest::Client,
    config: CloudConfig,
    identity: Arc<dyn IdentityProvider>,
}

impl CloudRegistrar {
    pub fn new(config: CloudConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            identity,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> RegistrationError {
    if e.is_timeout() {
        RegistrationError::Timeout
    } else {
        RegistrationError::Network(e.to_string())
    }
}

#[async_trait]
impl Registrar for CloudRegistrar {
    async fn register(&self, kind: RuleSetKind, rules: &[ForwardingRule]) -> Result<Registration> {
        let identity = self
            .identity
            .identity()
            .await
            .ok_or(EngineError::NotAuthenticated)?;

        let payload = translate(rules);
        let url = self.config.endpoint(kind);
        info!(
            "Registering {} proxies ({} of {} rules) with {}",
            kind,
            payload.len(),
            rules.len(),
            url
        );

        let response = self
            .http
            .post(url)
            .header("companyid", &identity.company_id)
            .header("userid", &identity.user_id)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            warn!("Registration endpoint returned HTTP {}", status);
            return Err(RegistrationError::Status(status.as_u16()).into());
        }

        let body = response.text().await.map_err(map_transport_error)?;
        let registration = parse_response(kind, &body)?;

        info!(
            "Registered {} tunnel ({} bytes of configuration{})",
            kind,
            registration.config_text.len(),
            if registration.visitor_code.is_some() {
                ", visitor code issued"
            } else {
                ""
            }
        );

        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityProvider;

    #[test]
    fn test_translate_ssh_rule() {
        let rules = vec![ForwardingRule::new("ssh", 22).normalized(RuleSetKind::Main)];
        assert_eq!(
            translate(&rules),
            vec![CloudProxy {
                local_ip: "127.0.0.1".to_string(),
                local_port: "22".to_string(),
                remote_port: "30022".to_string(),
                proxy_type: "tcp".to_string(),
            }]
        );
    }

    #[test]
    fn test_translate_random_port_rules() {
        let rules = vec![
            ForwardingRule::new("db", 15432).normalized(RuleSetKind::Main),
            ForwardingRule::new("web", 8080).normalized(RuleSetKind::Main),
            ForwardingRule::new("broken", 0),
        ];
        let payload = translate(&rules);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0].local_port, "15432");
        assert_eq!(payload[0].remote_port, "0");
        assert_eq!(payload[1].remote_port, "38080");
    }

    #[test]
    fn test_wire_shape() {
        let rules = vec![ForwardingRule::new("web", 8080).normalized(RuleSetKind::Temporary)];
        let json = serde_json::to_value(translate(&rules)).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "localIp": "127.0.0.1",
                "localPort": "8080",
                "remotePort": "48080",
                "type": "tcp"
            }])
        );
    }

    #[test]
    fn test_parse_success() {
        let body = r#"{"status": 0, "generatedConfigText": "remotePort = 30022", "visitorCode": "IGNORED"}"#;
        let registration = parse_response(RuleSetKind::Main, body).unwrap();
        assert_eq!(registration.config_text, "remotePort = 30022");
        assert_eq!(registration.visitor_code, None);

        let body = r#"{"status": "0", "generatedConfigText": "x", "visitorCode": " 8K2Q "}"#;
        let registration = parse_response(RuleSetKind::Temporary, body).unwrap();
        assert_eq!(registration.visitor_code.as_deref(), Some("8K2Q"));
    }

    #[test]
    fn test_parse_rejection() {
        let body = r#"{"status": 1003, "msg": "quota exceeded"}"#;
        match parse_response(RuleSetKind::Main, body) {
            Err(RegistrationError::Rejected { status, message }) => {
                assert_eq!(status, "1003");
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_response(RuleSetKind::Main, "<html>bad gateway</html>"),
            Err(RegistrationError::MalformedBody(_))
        ));
        assert!(matches!(
            parse_response(RuleSetKind::Main, r#"{"status": 0}"#),
            Err(RegistrationError::MalformedBody(_))
        ));
    }

    #[tokio::test]
    async fn test_register_without_identity_fails_before_network() {
        let mut identity = MockIdentityProvider::new();
        identity.expect_identity().times(1).returning(|| None);

        let config = CloudConfig {
            // nothing listens here; reaching the network would be a Network error
            proxy_url: "http://127.0.0.1:9/proxy".to_string(),
            ..Default::default()
        };
        let registrar = CloudRegistrar::new(config, Arc::new(identity)).unwrap();

        let rules = vec![ForwardingRule::new("ssh", 22).normalized(RuleSetKind::Main)];
        let result = registrar.register(RuleSetKind::Main, &rules).await;
        assert!(matches!(result, Err(EngineError::NotAuthenticated)));
    }
}
