//! In-memory picture of the tunnel mesh.
//!
//! Two prefix maps hold the canonical state: `routes` keyed by the
//! advertised network, `tunnels` keyed by the remote outer endpoint at /32.
//! Cross-references are map keys rather than pointers: a route's `gateway`
//! names its tunnel, a tunnel's `routes` lists the networks linked to it.

use std::net::Ipv4Addr;
use std::time::Instant;

use ip_network::Ipv4Network;

use crate::kernel::TunnelConfig;
use crate::prefix_map::PrefixMap;

/// Per-prefix decision applied to incoming advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub net: Ipv4Network,
    /// Outer address of the remote endpoint; key of the owning tunnel.
    pub gateway: Ipv4Addr,
    pub expires: Instant,
}

#[derive(Debug, Clone)]
pub struct Tunnel {
    pub ifname: String,
    pub ifnum: u32,
    pub outer_local: Ipv4Addr,
    pub outer_remote: Ipv4Addr,
    pub inner_local: Ipv4Addr,
    /// Address of the basis route's network; the interface's peer address.
    pub inner_remote: Ipv4Addr,
    /// Networks linked to this tunnel (keys into the routes map).
    pub routes: Vec<Ipv4Network>,
    /// Statically managed interfaces are never created or torn down.
    pub static_if: bool,
}

impl Tunnel {
    pub fn nref(&self) -> usize {
        self.routes.len()
    }

    pub fn config(&self) -> TunnelConfig {
        TunnelConfig {
            ifname: self.ifname.clone(),
            outer_local: self.outer_local,
            outer_remote: self.outer_remote,
            inner_local: self.inner_local,
            inner_remote: self.inner_remote,
        }
    }
}

#[derive(Default)]
pub struct Model {
    pub routes: PrefixMap<Route>,
    pub tunnels: PrefixMap<Tunnel>,
}

/// The /32 key under which a tunnel is stored.
pub fn host_net(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::new_truncate(addr, 32).expect("/32 is a valid prefix length")
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tunnel(&self, gateway: Ipv4Addr) -> Option<&Tunnel> {
        self.tunnels.get(host_net(gateway))
    }

    pub fn tunnel_mut(&mut self, gateway: Ipv4Addr) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(host_net(gateway))
    }

    /// Drops the link from a tunnel to a route key. The route itself is the
    /// caller's business.
    pub fn unlink(&mut self, net: Ipv4Network, gateway: Ipv4Addr) {
        if let Some(tunnel) = self.tunnel_mut(gateway) {
            tunnel.routes.retain(|k| *k != net);
        }
    }

    /// Asserts every cross-reference invariant. Test support.
    #[cfg(test)]
    pub fn check_consistency(&self) {
        for (key, tunnel) in self.tunnels.iter() {
            assert_eq!(key, host_net(tunnel.outer_remote), "tunnel key mismatch");
            for net in &tunnel.routes {
                let route = self
                    .routes
                    .get(*net)
                    .unwrap_or_else(|| panic!("{net} linked to {} but not stored", tunnel.ifname));
                assert_eq!(route.gateway, tunnel.outer_remote, "gateway mismatch for {net}");
            }
            if !tunnel.routes.is_empty() {
                assert!(
                    tunnel
                        .routes
                        .iter()
                        .any(|net| net.network_address() == tunnel.inner_remote),
                    "tunnel {} has no basis route for {}",
                    tunnel.ifname,
                    tunnel.inner_remote
                );
            }
        }
        for (key, route) in self.routes.iter() {
            assert_eq!(key, route.net, "route key mismatch");
            let tunnel = self
                .tunnel(route.gateway)
                .unwrap_or_else(|| panic!("route {key} names missing tunnel {}", route.gateway));
            assert!(
                tunnel.routes.contains(&key),
                "route {key} not linked back from {}",
                tunnel.ifname
            );
        }
    }
}
