mod address;

pub use address::{HostResolver, ReachableAddressFinder, SystemResolver};

use crate::forwarder::{ForwarderError, PortForwarder};
use crate::net::{Cidr, HostAndPort, Protocol};
use crate::throttle::ObtainThrottle;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const USE_PORT_FORWARDING: &str = "usePortForwarding";
pub const WAIT_FOR_SSHABLE: &str = "waitForSshable";
pub const USER: &str = "user";

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("No machines available: {0}")]
    NoMachinesAvailable(String),
    #[error("Provisioning failed: {0}")]
    Provider(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No port forwarder configured for the location")]
    MissingPortForwarder,
    #[error("No reachable address found for {node}")]
    Unreachable { node: String },
    #[error("No addresses known for {node}")]
    NoAddress { node: String },
}

/// Configuration of a [SubnetLocation].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationConfig {
    /// Minimum time, in milliseconds, between the start of two obtain calls.
    ///
    /// Zero or negative disables throttling.
    pub time_between_obtains: i64,
    pub use_port_forwarding: bool,
    /// When false, an unresolvable machine address falls back to any known address.
    pub wait_for_sshable: bool,
    pub user: String,
    /// Milliseconds to spend looking for a reachable address.
    pub reachable_timeout: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            time_between_obtains: 0,
            use_port_forwarding: false,
            wait_for_sshable: true,
            user: "root".to_string(),
            reachable_timeout: 60_000,
        }
    }
}

impl LocationConfig {
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn time_between_obtains(&self) -> Duration {
        Duration::from_millis(self.time_between_obtains.max(0) as u64)
    }

    pub fn reachable_timeout(&self) -> Duration {
        Duration::from_millis(self.reachable_timeout)
    }
}

/// What a [MachineProvisioner] is asked to create.
pub struct ObtainRequest {
    /// Caller flags, with the location's settings merged in.
    pub flags: Map<String, Value>,
    pub port_forwarder: Arc<dyn PortForwarder>,
}

/// A VM as reported by the cloud once it has been provisioned.
#[derive(Debug, Clone)]
pub struct ProvisionedNode {
    pub id: String,
    pub hostname: String,
    /// The SSH endpoint, when the provider reports one separately from the hostname.
    pub ssh_host_and_port: Option<HostAndPort>,
    pub login_port: u16,
    pub public_addresses: Vec<String>,
    pub private_addresses: Vec<String>,
    pub provider: String,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
}

/// Creates VMs in the cloud.
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    async fn obtain(&self, request: ObtainRequest) -> Result<ProvisionedNode, LocationError>;
}

/// A machine obtained from a [SubnetLocation], reachable through its port forwarder.
#[derive(Clone)]
pub struct MachineLocation {
    display_name: String,
    address: String,
    port: u16,
    user: String,
    node_id: String,
    region: Option<String>,
    availability_zone: Option<String>,
    config: Map<String, Value>,
    port_forwarder: Arc<dyn PortForwarder>,
}

impl MachineLocation {
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The SSH port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn availability_zone(&self) -> Option<&str> {
        self.availability_zone.as_deref()
    }

    /// The flags the machine was obtained with.
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn port_forwarder(&self) -> &Arc<dyn PortForwarder> {
        &self.port_forwarder
    }

    /// Forwards a public port chosen by the port forwarder to `target_port` on this machine.
    pub async fn forward_port(
        &self,
        target_port: u16,
        protocol: Protocol,
        accessing_cidr: Cidr,
    ) -> Result<HostAndPort, ForwarderError> {
        self.port_forwarder
            .open_port_forwarding_to_machine(self, target_port, None, protocol, accessing_cidr)
            .await
    }
}

impl Debug for MachineLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineLocation")
            .field("display_name", &self.display_name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// A location that provisions machines on a subnet reached through port forwarding.
///
/// Calls to [SubnetLocation::obtain] are paced by an [ObtainThrottle]; share one throttle
/// between locations (by cloning its [Arc]) to pace them together.
pub struct SubnetLocation {
    config: LocationConfig,
    provisioner: Arc<dyn MachineProvisioner>,
    throttle: Arc<ObtainThrottle>,
    port_forwarder: Option<Arc<dyn PortForwarder>>,
    resolver: Arc<dyn HostResolver>,
    finder: Option<Arc<dyn ReachableAddressFinder>>,
}

impl SubnetLocation {
    /// Creates a location with its own throttle, spaced by the configured `timeBetweenObtains`.
    pub fn new(config: LocationConfig, provisioner: Arc<dyn MachineProvisioner>) -> Self {
        let throttle = Arc::new(ObtainThrottle::new(config.time_between_obtains()));
        Self {
            config,
            provisioner,
            throttle,
            port_forwarder: None,
            resolver: Arc::new(SystemResolver),
            finder: None,
        }
    }

    /// Replace the location's throttle with a shared one.
    pub fn with_throttle(mut self, throttle: Arc<ObtainThrottle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// The forwarder handed to the provisioner and to every obtained machine.
    pub fn with_port_forwarder(mut self, port_forwarder: Arc<dyn PortForwarder>) -> Self {
        self.port_forwarder = Some(port_forwarder);
        self
    }

    pub fn with_address_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Used when a machine's reported address does not resolve.
    ///
    /// By default no reachability search is done.
    pub fn with_address_finder(mut self, finder: Arc<dyn ReachableAddressFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn throttle(&self) -> &Arc<ObtainThrottle> {
        &self.throttle
    }

    /// Provisions a machine.
    ///
    /// `flags` may override `waitForSshable` and `user` for this call. Fails before anything is
    /// provisioned if no port forwarder is configured.
    pub async fn obtain(&self, flags: Map<String, Value>) -> Result<MachineLocation, LocationError> {
        let port_forwarder = self
            .port_forwarder
            .clone()
            .ok_or(LocationError::MissingPortForwarder)?;
        let mut setup = flags;
        setup.insert(
            USE_PORT_FORWARDING.to_string(),
            Value::Bool(self.config.use_port_forwarding),
        );
        let request = ObtainRequest {
            flags: setup.clone(),
            port_forwarder: port_forwarder.clone(),
        };

        log::info!("provision - waiting for admission to obtain");
        let node = self.throttle.run(self.provisioner.obtain(request)).await?;
        self.create_machine_location(node, setup, port_forwarder)
            .await
    }

    async fn create_machine_location(
        &self,
        node: ProvisionedNode,
        setup: Map<String, Value>,
        port_forwarder: Arc<dyn PortForwarder>,
    ) -> Result<MachineLocation, LocationError> {
        let wait_for_sshable = setup_bool(&setup, WAIT_FOR_SSHABLE, self.config.wait_for_sshable);
        let user = setup
            .get(USER)
            .and_then(Value::as_str)
            .unwrap_or(&self.config.user)
            .to_owned();

        let address = address::machine_address(
            &node,
            wait_for_sshable,
            self.resolver.as_ref(),
            self.finder.as_deref(),
            self.config.reachable_timeout(),
        )
        .await?;
        let port = node
            .ssh_host_and_port
            .as_ref()
            .and_then(HostAndPort::port)
            .unwrap_or(node.login_port);
        // Not every provider has regions, fall back to the provider itself
        let region = node.region.clone().or_else(|| Some(node.provider.clone()));

        log::debug!(
            "creating machine location for {user}@{address}:{port} ({})",
            node.id
        );
        Ok(MachineLocation {
            display_name: node.hostname,
            address,
            port,
            user,
            node_id: node.id,
            region,
            availability_zone: node.availability_zone,
            config: setup,
            port_forwarder,
        })
    }
}

// Flags may carry booleans either as JSON booleans or as strings.
fn setup_bool(setup: &Map<String, Value>, key: &str, default: bool) -> bool {
    match setup.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.eq_ignore_ascii_case("false"),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::address::testing::{StaticFinder, StaticResolver};
    use super::*;
    use crate::forwarder::testing::RecordingForwarder;
    use actix_web::rt::time::Instant;
    use serde_json::json;
    use std::sync::Mutex;

    const MS: Duration = Duration::from_millis(1);

    #[derive(Default)]
    struct MockProvisioner {
        // Start time, flags and forwarder of each call
        calls: Mutex<Vec<(Instant, Map<String, Value>, Arc<dyn PortForwarder>)>>,
        duration: Duration,
        fail: bool,
    }

    #[async_trait]
    impl MachineProvisioner for MockProvisioner {
        async fn obtain(&self, request: ObtainRequest) -> Result<ProvisionedNode, LocationError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((
                    Instant::now(),
                    request.flags,
                    request.port_forwarder,
                ));
                calls.len()
            };
            if self.fail {
                return Err(LocationError::NoMachinesAvailable(
                    "quota exceeded".to_string(),
                ));
            }
            if !self.duration.is_zero() {
                tokio::time::sleep(self.duration).await;
            }
            Ok(ProvisionedNode {
                id: format!("vm-{n}"),
                hostname: format!("vm-{n}.internal"),
                ssh_host_and_port: Some(HostAndPort::new("203.0.113.10", 2200 + n as u16)),
                login_port: 22,
                public_addresses: vec![],
                private_addresses: vec![format!("10.0.0.{n}")],
                provider: "vcloud-director".to_string(),
                region: None,
                availability_zone: Some("zone-a".to_string()),
            })
        }
    }

    fn location(config: LocationConfig, provisioner: Arc<MockProvisioner>) -> SubnetLocation {
        SubnetLocation::new(config, provisioner)
            .with_port_forwarder(Arc::new(RecordingForwarder::default()))
            .with_address_resolver(Arc::new(StaticResolver::of(&["203.0.113.10"])))
    }

    #[test]
    fn test_config_from_json() {
        let config = LocationConfig::from_json(json!({
            "timeBetweenObtains": 2500,
            "usePortForwarding": true,
        }))
        .unwrap();
        assert_eq!(config.time_between_obtains(), MS * 2500);
        assert!(config.use_port_forwarding);
        // Unset keys keep their defaults
        assert!(config.wait_for_sshable);
        assert_eq!(config.user, "root");
        assert_eq!(config.reachable_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_negative_time_between_obtains() {
        let config = LocationConfig::from_json(json!({ "timeBetweenObtains": -1 })).unwrap();
        assert_eq!(config.time_between_obtains(), Duration::ZERO);
        assert_eq!(
            LocationConfig::default().time_between_obtains(),
            Duration::ZERO
        );
    }

    #[actix_web::test]
    async fn test_obtain() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner::default());
        let config = LocationConfig {
            use_port_forwarding: true,
            ..Default::default()
        };
        let location = location(config, provisioner.clone());
        let mut flags = Map::new();
        flags.insert("imageId".to_string(), json!("centos-7"));
        let machine = location.obtain(flags).await.unwrap();

        assert_eq!(machine.address(), "203.0.113.10");
        assert_eq!(machine.port(), 2201);
        assert_eq!(machine.user(), "root");
        assert_eq!(machine.node_id(), "vm-1");
        assert_eq!(machine.display_name(), "vm-1.internal");
        assert_eq!(machine.region(), Some("vcloud-director"));
        assert_eq!(machine.availability_zone(), Some("zone-a"));
        assert_eq!(machine.config()["imageId"], json!("centos-7"));

        let calls = provisioner.calls.lock().unwrap();
        let (_, flags, forwarder) = &calls[0];
        assert_eq!(flags[USE_PORT_FORWARDING], json!(true));
        assert_eq!(flags["imageId"], json!("centos-7"));
        assert!(Arc::ptr_eq(forwarder, machine.port_forwarder()));
    }

    #[actix_web::test]
    async fn test_flags_override_config() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner::default());
        // Nothing resolves or is reachable, so only waitForSshable=false can succeed
        let location = SubnetLocation::new(LocationConfig::default(), provisioner)
            .with_port_forwarder(Arc::new(RecordingForwarder::default()))
            .with_address_resolver(Arc::new(StaticResolver::of(&[])))
            .with_address_finder(Arc::new(StaticFinder::of(&[])));
        let err = location.obtain(Map::new()).await.unwrap_err();
        assert!(matches!(err, LocationError::Unreachable { .. }));

        let mut flags = Map::new();
        flags.insert(WAIT_FOR_SSHABLE.to_string(), json!("false"));
        flags.insert(USER.to_string(), json!("admin"));
        let machine = location.obtain(flags).await.unwrap();
        assert_eq!(machine.address(), "10.0.0.2");
        assert_eq!(machine.user(), "admin");
    }

    #[actix_web::test]
    async fn test_obtain_is_throttled() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner {
            duration: Duration::from_secs(5),
            ..Default::default()
        });
        let config = LocationConfig {
            time_between_obtains: 100,
            ..Default::default()
        };
        let first = location(config.clone(), provisioner.clone());
        // A second location sharing the first one's throttle
        let second =
            location(config, provisioner.clone()).with_throttle(first.throttle().clone());

        let start = Instant::now();
        let (a, b, c) = futures::join!(
            first.obtain(Map::new()),
            second.obtain(Map::new()),
            first.obtain(Map::new())
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let calls = provisioner.calls.lock().unwrap();
        let starts: Vec<Duration> = calls.iter().map(|(at, _, _)| *at - start).collect();
        assert_eq!(starts.len(), 3);
        // Each call starts in its slot, give or take a timer tick
        for (i, at) in starts.iter().enumerate() {
            let slot = MS * 100 * i as u32;
            assert!(*at >= slot && *at <= slot + MS, "call {i} started at {at:?}");
        }
        // The calls themselves overlapped, finishing well before 3 * 5s
        assert!(Instant::now() - start < Duration::from_secs(6));
    }

    #[actix_web::test]
    async fn test_independent_locations_are_not_throttled_together() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner::default());
        let config = LocationConfig {
            time_between_obtains: 1000,
            ..Default::default()
        };
        let first = location(config.clone(), provisioner.clone());
        let second = location(config, provisioner.clone());
        let start = Instant::now();
        first.obtain(Map::new()).await.unwrap();
        second.obtain(Map::new()).await.unwrap();
        let calls = provisioner.calls.lock().unwrap();
        assert!(calls.iter().all(|(at, _, _)| *at == start));
    }

    #[actix_web::test]
    async fn test_provisioning_errors_propagate() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner {
            fail: true,
            ..Default::default()
        });
        let location = location(LocationConfig::default(), provisioner);
        let err = location.obtain(Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "No machines available: quota exceeded");
    }

    #[actix_web::test]
    async fn test_port_forwarder_required() {
        tokio::time::pause();
        let provisioner = Arc::new(MockProvisioner::default());
        let location = SubnetLocation::new(LocationConfig::default(), provisioner.clone())
            .with_address_resolver(Arc::new(StaticResolver::of(&["203.0.113.10"])));
        let err = location.obtain(Map::new()).await.unwrap_err();
        assert!(matches!(err, LocationError::MissingPortForwarder));
        // Nothing was provisioned, so no machine is left behind
        assert!(provisioner.calls.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_forward_port() {
        tokio::time::pause();
        let forwarder = Arc::new(RecordingForwarder::default());
        let location = SubnetLocation::new(
            LocationConfig::default(),
            Arc::new(MockProvisioner::default()),
        )
        .with_port_forwarder(forwarder.clone())
        .with_address_resolver(Arc::new(StaticResolver::of(&["203.0.113.10"])));
        let machine = location.obtain(Map::new()).await.unwrap();
        let public = machine
            .forward_port(8080, Protocol::Tcp, Cidr::universal())
            .await
            .unwrap();
        assert_eq!(public, HostAndPort::new(RecordingForwarder::GATEWAY, 10000));
        assert_eq!(
            forwarder.calls(),
            vec!["forward 10000 -> 203.0.113.10:8080 TCP"]
        );
    }
}
