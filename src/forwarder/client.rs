use crate::entity::{AttributeSensor, ConfigKey, Entity};
use crate::forwarder::{ForwarderError, PortForwarder};
use crate::location::MachineLocation;
use crate::net::{Cidr, HostAndPort, PortRange, Protocol};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;

type Supplier = dyn Fn() -> Result<Arc<dyn PortForwarder>, ForwarderError> + Send + Sync;

/// A [PortForwarder] that delegates to another, looked up lazily.
///
/// The delegate is resolved on first use and then cached; a failed lookup is retried on the next
/// call. This lets a client be created (and persisted alongside its owner) before the real
/// forwarder exists.
pub struct PortForwarderClient {
    supplier: Box<Supplier>,
    delegate: OnceCell<Arc<dyn PortForwarder>>,
}

impl PortForwarderClient {
    pub fn from_supplier<F>(supplier: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn PortForwarder>, ForwarderError> + Send + Sync + 'static,
    {
        Self {
            supplier: Box::new(supplier),
            delegate: OnceCell::new(),
        }
    }

    /// Uses the result of a getter on the entity.
    ///
    /// # Arguments
    ///
    /// * `name`: Describes the getter in error messages.
    pub fn from_getter_on_entity<E, G>(entity: Arc<E>, name: &'static str, getter: G) -> Self
    where
        E: Entity + 'static,
        G: Fn(&E) -> Option<Arc<dyn PortForwarder>> + Send + Sync + 'static,
    {
        Self::from_supplier(move || {
            getter(entity.as_ref()).ok_or_else(|| unavailable(name, entity.as_ref()))
        })
    }

    /// Uses the entity's value for a config key.
    pub fn from_config_on_entity<E>(entity: Arc<E>, key: ConfigKey<Arc<dyn PortForwarder>>) -> Self
    where
        E: Entity + 'static,
    {
        Self::from_supplier(move || {
            entity
                .config(&key)
                .ok_or_else(|| unavailable(key.name(), entity.as_ref()))
        })
    }

    /// Uses the entity's current value for an attribute.
    pub fn from_attribute_on_entity<E>(
        entity: Arc<E>,
        sensor: AttributeSensor<Arc<dyn PortForwarder>>,
    ) -> Self
    where
        E: Entity + 'static,
    {
        Self::from_supplier(move || {
            entity
                .attribute(&sensor)
                .ok_or_else(|| unavailable(sensor.name(), entity.as_ref()))
        })
    }

    fn delegate(&self) -> Result<&Arc<dyn PortForwarder>, ForwarderError> {
        self.delegate.get_or_try_init(|| {
            let delegate = (self.supplier)()?;
            log::debug!("Resolved port forwarder delegate");
            Ok(delegate)
        })
    }
}

fn unavailable<E: Entity>(via: &str, entity: &E) -> ForwarderError {
    ForwarderError::Unavailable {
        via: via.to_owned(),
        entity: entity.display_name().to_owned(),
    }
}

#[async_trait]
impl PortForwarder for PortForwarderClient {
    async fn open_gateway(&self) -> Result<String, ForwarderError> {
        self.delegate()?.open_gateway().await
    }

    async fn open_static_nat(&self, service: &dyn Entity) -> Result<String, ForwarderError> {
        self.delegate()?.open_static_nat(service).await
    }

    async fn open_firewall_port(
        &self,
        entity: &dyn Entity,
        port: u16,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<(), ForwarderError> {
        self.delegate()?
            .open_firewall_port(entity, port, protocol, accessing_cidr)
            .await
    }

    async fn open_firewall_port_range(
        &self,
        entity: &dyn Entity,
        port_range: PortRange,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<(), ForwarderError> {
        self.delegate()?
            .open_firewall_port_range(entity, port_range, protocol, accessing_cidr)
            .await
    }

    async fn open_port_forwarding_to_machine(
        &self,
        machine: &MachineLocation,
        target_port: u16,
        public_port: Option<u16>,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<HostAndPort, ForwarderError> {
        self.delegate()?
            .open_port_forwarding_to_machine(
                machine,
                target_port,
                public_port,
                protocol,
                accessing_cidr,
            )
            .await
    }

    async fn open_port_forwarding(
        &self,
        target: &HostAndPort,
        public_port: Option<u16>,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<HostAndPort, ForwarderError> {
        self.delegate()?
            .open_port_forwarding(target, public_port, protocol, accessing_cidr)
            .await
    }

    fn is_client(&self) -> bool {
        true
    }
}
