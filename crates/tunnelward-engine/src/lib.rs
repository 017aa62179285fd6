//! Tunnel registration and reconciliation engine
//!
//! Keeps a reverse-tunnel client's forwarding rules, the cloud-generated
//! client configuration and the running client processes in agreement.
//! Outer layers talk to the [`Controller`].

pub mod bind_port;
pub mod config;
pub mod controller;
pub mod drift;
pub mod error;
pub mod identity;
pub mod lock;
pub mod process;
pub mod registration;
pub mod rules;
pub mod store;
pub mod supervisor;

pub use bind_port::BindPort;
pub use config::{CloudConfig, ClientConfig, EngineConfig, IdentityConfig, Layout};
pub use controller::{Consistency, Controller, SaveOutcome, Status, TemporaryOutcome};
pub use error::{EngineError, RegistrationError, Result, ValidationError};
pub use identity::{CloudIdentity, IdentityProvider, StaticIdentity};
pub use lock::TunnelLock;
pub use registration::{CloudProxy, CloudRegistrar, Registrar, Registration};
pub use rules::{ForwardingRule, RuleSetKind, MAX_RULES};
pub use store::RuleStore;
pub use supervisor::{SupervisorConfig, TunnelState, TunnelSupervisor};
