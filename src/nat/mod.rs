//! NAT rules on a cloud director's edge gateway, and a REST resource for managing them.

mod resource;

pub use resource::{NatService, NatServiceError};

use crate::net::{HostAndPort, Protocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("No NAT rule matching {0}")]
    NotFound(String),
    #[error("Cloud director request failed: {0}")]
    Director(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The cloud director to act on, and the credentials to act with.
#[derive(Clone, Deserialize)]
pub struct DirectorEndpoint {
    pub endpoint: String,
    pub identity: String,
    pub credential: String,
}

impl Debug for DirectorEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorEndpoint")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NatRuleType {
    Dnat,
    Snat,
}

/// A NAT rule as reported by the cloud director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub id: Option<String>,
    pub rule_type: NatRuleType,
    pub enabled: bool,
    pub description: Option<String>,
    /// The gateway interface the rule is applied on.
    pub interface: Option<String>,
    pub protocol: Option<String>,
    pub original_ip: String,
    /// A port, a port range or `any`.
    pub original_port: Option<String>,
    pub translated_ip: String,
    pub translated_port: Option<String>,
}

/// The representation of a [NatRule] returned to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRuleSummary {
    pub id: Option<String>,
    pub rule_type: NatRuleType,
    pub enabled: bool,
    pub protocol: Option<String>,
    pub original_ip: String,
    pub original_port: Option<String>,
    pub translated_ip: String,
    pub translated_port: Option<String>,
}

impl From<&NatRule> for NatRuleSummary {
    fn from(rule: &NatRule) -> Self {
        Self {
            id: rule.id.clone(),
            rule_type: rule.rule_type,
            enabled: rule.enabled,
            protocol: rule.protocol.clone(),
            original_ip: rule.original_ip.clone(),
            original_port: rule.original_port.clone(),
            translated_ip: rule.translated_ip.clone(),
            translated_port: rule.translated_port.clone(),
        }
    }
}

/// A DNAT rule from a public address and port to a private target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardingConfig {
    pub protocol: Protocol,
    pub public_ip: String,
    pub public_port: u16,
    pub target: HostAndPort,
}

impl Display for PortForwardingConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol,
            HostAndPort::new(self.public_ip.as_str(), self.public_port),
            self.target
        )
    }
}

/// Carries out NAT operations against a cloud director.
#[async_trait]
pub trait NatDispatcher: Send + Sync {
    async fn nat_rules(&self, endpoint: &DirectorEndpoint) -> Result<Vec<NatRule>, NatError>;

    async fn open_port_forwarding(
        &self,
        endpoint: &DirectorEndpoint,
        config: PortForwardingConfig,
    ) -> Result<(), NatError>;

    /// Fails with [NatError::NotFound] if no rule matches `config`.
    async fn close_port_forwarding(
        &self,
        endpoint: &DirectorEndpoint,
        config: PortForwardingConfig,
    ) -> Result<(), NatError>;
}
