mod client;

pub use client::PortForwarderClient;

use crate::entity::Entity;
use crate::location::MachineLocation;
use crate::net::{Cidr, HostAndPort, PortRange, Protocol};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("No PortForwarder available via {via} on {entity}")]
    Unavailable { via: String, entity: String },
    #[error("Port forwarding backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Opens gateways, firewall ports and NAT port forwarding rules for machines on a subnet.
///
/// Implementations talk to the cloud's network management API; this crate only delegates to
/// them.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Opens the subnet's gateway, returning its public address.
    async fn open_gateway(&self) -> Result<String, ForwarderError>;

    /// Allocates a static NAT address for the entity, returning it.
    async fn open_static_nat(&self, service: &dyn Entity) -> Result<String, ForwarderError>;

    async fn open_firewall_port(
        &self,
        entity: &dyn Entity,
        port: u16,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<(), ForwarderError>;

    async fn open_firewall_port_range(
        &self,
        entity: &dyn Entity,
        port_range: PortRange,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<(), ForwarderError>;

    /// Forwards a public port to `target_port` on the machine.
    ///
    /// # Arguments
    ///
    /// * `public_port`: The public port to use, or None to let the backend choose.
    ///
    /// Returns the public side of the mapping.
    async fn open_port_forwarding_to_machine(
        &self,
        machine: &MachineLocation,
        target_port: u16,
        public_port: Option<u16>,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<HostAndPort, ForwarderError>;

    /// Forwards a public port to `target`, returning the public side of the mapping.
    async fn open_port_forwarding(
        &self,
        target: &HostAndPort,
        public_port: Option<u16>,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<HostAndPort, ForwarderError>;

    /// True if this forwarder only delegates to another one.
    fn is_client(&self) -> bool {
        false
    }
}
