//! Cloud identity used to authenticate registration calls

use async_trait::async_trait;

use crate::config::IdentityConfig;

/// Company/user pair sent with every registration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudIdentity {
    pub company_id: String,
    pub user_id: String,
}

impl CloudIdentity {
    /// Both ids must be present; a partial identity is no identity
    pub fn new(company_id: impl Into<String>, user_id: impl Into<String>) -> Option<Self> {
        let company_id = company_id.into().trim().to_string();
        let user_id = user_id.into().trim().to_string();
        if company_id.is_empty() || user_id.is_empty() {
            return None;
        }
        Some(Self {
            company_id,
            user_id,
        })
    }
}

/// Source of the current cloud identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current identity, or `None` when nobody is signed in
    async fn identity(&self) -> Option<CloudIdentity>;
}

/// Identity fixed at construction time
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    identity: Option<CloudIdentity>,
}

impl StaticIdentity {
    pub fn new(identity: Option<CloudIdentity>) -> Self {
        Self { identity }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        let identity = match (&config.company_id, &config.user_id) {
            (Some(company), Some(user)) => CloudIdentity::new(company.as_str(), user.as_str()),
            _ => None,
        };
        Self { identity }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn identity(&self) -> Option<CloudIdentity> {
        self.identity.clone()
    }
}
