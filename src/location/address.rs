use crate::location::{LocationError, ProvisionedNode};
use async_trait::async_trait;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

/// Checks whether a host name can be resolved.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolves(&self, host: &str) -> bool;
}

/// Resolves host names with the operating system's resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolves(&self, host: &str) -> bool {
        if host.parse::<IpAddr>().is_ok() {
            return true;
        }
        let host = host.to_owned();
        actix_web::rt::task::spawn_blocking(move || {
            (host.as_str(), 0)
                .to_socket_addrs()
                .map(|mut addrs| addrs.next().is_some())
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

/// Finds which of a machine's addresses can actually be reached.
#[async_trait]
pub trait ReachableAddressFinder: Send + Sync {
    /// Returns the first candidate found to be reachable within `timeout`, if any.
    async fn find_reachable(&self, candidates: &[String], timeout: Duration) -> Option<String>;
}

/// Picks the address used to reach a newly provisioned machine.
///
/// The reported SSH host (or failing that the VM's hostname) is used if it resolves. Otherwise
/// a reachable public or private address is searched for; when the caller does not need the
/// machine to be sshable, the first known address is accepted as a last resort.
pub(crate) async fn machine_address(
    node: &ProvisionedNode,
    wait_for_sshable: bool,
    resolver: &dyn HostResolver,
    finder: Option<&dyn ReachableAddressFinder>,
    timeout: Duration,
) -> Result<String, LocationError> {
    let address = match &node.ssh_host_and_port {
        Some(ssh) => ssh.host(),
        None => node.hostname.as_str(),
    };
    if resolver.resolves(address).await {
        return Ok(address.to_owned());
    }

    let candidates: Vec<String> = node
        .public_addresses
        .iter()
        .chain(&node.private_addresses)
        .cloned()
        .collect();

    if !wait_for_sshable {
        log::debug!(
            "Could not resolve reported address '{address}' for {} ({}), waitForSshable=false, \
             so requesting reachable address",
            node.hostname,
            node.id
        );
        return match find_reachable(finder, &candidates, timeout).await {
            Some(reachable) => Ok(reachable),
            None => {
                let first = candidates.into_iter().next().ok_or_else(|| {
                    LocationError::NoAddress {
                        node: node.id.clone(),
                    }
                })?;
                log::warn!(
                    "Could not resolve reachable address for {}; falling back to first address {first}",
                    node.id
                );
                Ok(first)
            }
        };
    }

    log::debug!(
        "Could not resolve reported address '{address}' for {} ({}), requesting reachable address",
        node.hostname,
        node.id
    );
    find_reachable(finder, &candidates, timeout)
        .await
        .ok_or_else(|| LocationError::Unreachable {
            node: node.id.clone(),
        })
}

async fn find_reachable(
    finder: Option<&dyn ReachableAddressFinder>,
    candidates: &[String],
    timeout: Duration,
) -> Option<String> {
    match finder {
        Some(finder) => finder.find_reachable(candidates, timeout).await,
        None => None,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{StaticFinder, StaticResolver};
    use super::*;
    use crate::net::HostAndPort;

    const MINUTE: Duration = Duration::from_secs(60);

    fn node() -> ProvisionedNode {
        ProvisionedNode {
            id: "vapp-1/vm-1".to_string(),
            hostname: "vm-1.internal".to_string(),
            ssh_host_and_port: None,
            login_port: 22,
            public_addresses: vec!["198.51.100.7".to_string()],
            private_addresses: vec!["10.0.0.7".to_string()],
            provider: "vcloud-director".to_string(),
            region: None,
            availability_zone: None,
        }
    }

    #[actix_web::test]
    async fn test_prefers_resolvable_ssh_host() {
        let mut node = node();
        node.ssh_host_and_port = Some(HostAndPort::new("203.0.113.10", 2201));
        let resolver = StaticResolver::of(&["203.0.113.10", "vm-1.internal"]);
        let address = machine_address(&node, true, &resolver, None, MINUTE)
            .await
            .unwrap();
        assert_eq!(address, "203.0.113.10");
    }

    #[actix_web::test]
    async fn test_uses_resolvable_hostname() {
        let resolver = StaticResolver::of(&["vm-1.internal"]);
        let address = machine_address(&node(), true, &resolver, None, MINUTE)
            .await
            .unwrap();
        assert_eq!(address, "vm-1.internal");
    }

    #[actix_web::test]
    async fn test_unresolvable_finds_reachable() {
        let resolver = StaticResolver::of(&[]);
        let finder = StaticFinder::of(&["10.0.0.7"]);
        for wait_for_sshable in [true, false] {
            let address =
                machine_address(&node(), wait_for_sshable, &resolver, Some(&finder), MINUTE)
                    .await
                    .unwrap();
            assert_eq!(address, "10.0.0.7");
        }
    }

    #[actix_web::test]
    async fn test_not_sshable_falls_back_to_first_address() {
        let resolver = StaticResolver::of(&[]);
        let finder = StaticFinder::of(&[]);
        let address = machine_address(&node(), false, &resolver, Some(&finder), MINUTE)
            .await
            .unwrap();
        assert_eq!(address, "198.51.100.7");

        let mut empty = node();
        empty.public_addresses.clear();
        empty.private_addresses.clear();
        let err = machine_address(&empty, false, &resolver, None, MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, LocationError::NoAddress { .. }));
    }

    #[actix_web::test]
    async fn test_sshable_requires_reachable() {
        let resolver = StaticResolver::of(&[]);
        let finder = StaticFinder::of(&[]);
        let err = machine_address(&node(), true, &resolver, Some(&finder), MINUTE)
            .await
            .unwrap_err();
        assert!(matches!(err, LocationError::Unreachable { ref node } if node == "vapp-1/vm-1"));
    }

    #[actix_web::test]
    async fn test_system_resolver_accepts_ip_literals() {
        assert!(SystemResolver.resolves("127.0.0.1").await);
        assert!(SystemResolver.resolves("::1").await);
    }
}
