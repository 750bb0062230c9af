//! Startup discovery: rebuild the model from what the kernel already has.
//!
//! Unlike advertisement processing, discovery is strict. The daemon owns its
//! route table; anything in it that cannot be attributed to a managed tunnel
//! means a previous instance diverged, and adopting such a view would only
//! compound the damage.

use std::time::Instant;

use anyhow::{Context as _, Result, bail};

use crate::engine::Engine;
use crate::kernel::{IfaceRecord, Kernel, RouteRecord, RouteTarget};
use crate::model::{Route, Tunnel, host_net};

impl<K: Kernel> Engine<K> {
    /// Walks the kernel's interfaces and routes into the model, prunes the
    /// interface-owned host routes, stamps every route with a fresh expiry
    /// and drops tunnels nothing ended up referencing.
    pub fn bootstrap(&mut self, now: Instant) -> Result<()> {
        let (ifaces, routes) = self
            .kernel
            .discover()
            .context("failed to walk kernel state")?;

        for rec in ifaces {
            self.adopt_tunnel(rec)?;
        }
        for rec in routes {
            self.adopt_route(rec, now)?;
        }

        self.fix_overlaps();
        self.cleanup()?;

        tracing::info!(
            tunnels = self.model.tunnels.len(),
            routes = self.model.routes.len(),
            "kernel state adopted"
        );
        Ok(())
    }

    fn adopt_tunnel(&mut self, rec: IfaceRecord) -> Result<()> {
        let key = host_net(rec.outer_remote);
        let is_static = self.static_ifnums.contains(&rec.ordinal);
        let tunnel = Tunnel {
            ifname: rec.name.clone(),
            ifnum: rec.ordinal,
            outer_local: rec.outer_local,
            outer_remote: rec.outer_remote,
            inner_local: rec.inner_local,
            inner_remote: rec.inner_remote,
            routes: Vec::new(),
            static_if: is_static,
        };
        let (_, inserted) = self.model.tunnels.get_or_insert_with(key, || tunnel);
        if !inserted {
            bail!(
                "interfaces {} and {} both tunnel to {}",
                self.model
                    .tunnel(rec.outer_remote)
                    .map(|t| t.ifname.clone())
                    .unwrap_or_default(),
                rec.name,
                rec.outer_remote
            );
        }
        self.ifnums.set(rec.ordinal);
        tracing::debug!(ifname = %rec.name, outer_remote = %rec.outer_remote, "tunnel adopted");
        Ok(())
    }

    fn adopt_route(&mut self, rec: RouteRecord, now: Instant) -> Result<()> {
        let acceptable = self.policy_accepts(rec.net);
        let gateway = self.resolve_target(&rec.target);

        let Some(gateway) = gateway else {
            if acceptable {
                bail!("route {} leads to {:?}, which is no tunnel of ours", rec.net, rec.target);
            }
            tracing::debug!(net = %rec.net, "route outside the accept policy is not ours, skipping");
            return Ok(());
        };
        if !acceptable {
            bail!(
                "route {} is outside the accept policy but rides tunnel to {gateway}",
                rec.net
            );
        }

        let expires = now + self.route_timeout;
        let (route, inserted) = self.model.routes.get_or_insert_with(rec.net, || Route {
            net: rec.net,
            gateway,
            expires,
        });
        if !inserted {
            if route.gateway != gateway {
                bail!(
                    "route {} recorded twice with gateways {} and {gateway}",
                    rec.net,
                    route.gateway
                );
            }
            return Ok(());
        }
        let tunnel = self
            .model
            .tunnel_mut(gateway)
            .with_context(|| format!("no tunnel for gateway {gateway}"))?;
        tunnel.routes.push(rec.net);
        Ok(())
    }

    /// Collapses tunnels that came out of discovery without routes, then
    /// verifies the basis invariant for the rest.
    fn cleanup(&mut self) -> Result<()> {
        let idle: Vec<_> = self
            .model
            .tunnels
            .iter()
            .filter(|(_, t)| t.routes.is_empty())
            .map(|(_, t)| t.outer_remote)
            .collect();
        for gateway in idle {
            self.collapse(gateway)?;
        }

        for (_, tunnel) in self.model.tunnels.iter() {
            if tunnel.routes.is_empty() {
                continue; // static survivor
            }
            if !tunnel
                .routes
                .iter()
                .any(|net| net.network_address() == tunnel.inner_remote)
            {
                bail!(
                    "tunnel {} addresses its peer as {} but carries no such route",
                    tunnel.ifname,
                    tunnel.inner_remote
                );
            }
        }
        Ok(())
    }

    fn policy_accepts(&self, net: ip_network::Ipv4Network) -> bool {
        matches!(
            self.policy.nearest(net.network_address(), net.netmask()),
            Some((_, crate::model::Policy::Accept))
        )
    }

    /// A route's gateway slot either names an interface outright or carries
    /// an address, which is ours when some tunnel uses it as its inner peer.
    fn resolve_target(&self, target: &RouteTarget) -> Option<std::net::Ipv4Addr> {
        match target {
            RouteTarget::Interface(name) => self
                .model
                .tunnels
                .iter()
                .find_map(|(_, t)| (t.ifname == *name).then_some(t.outer_remote)),
            RouteTarget::Gateway(addr) => self
                .model
                .tunnels
                .iter()
                .find_map(|(_, t)| (t.inner_remote == *addr).then_some(t.outer_remote)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::engine::ROUTE_TIMEOUT;
    use crate::engine::tests::{engine, net};
    use crate::kernel::fake::Op;
    use crate::model::Policy;
    use crate::prefix_map::PrefixMap;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn iface(name: &str, ordinal: u32, outer_remote: &str, inner_remote: &str) -> IfaceRecord {
        IfaceRecord {
            name: name.to_owned(),
            ordinal,
            outer_local: addr("192.0.2.1"),
            outer_remote: addr(outer_remote),
            inner_local: addr("44.0.0.1"),
            inner_remote: addr(inner_remote),
        }
    }

    fn via_iface(n: &str, name: &str) -> RouteRecord {
        RouteRecord {
            net: net(n),
            target: RouteTarget::Interface(name.to_owned()),
        }
    }

    #[test]
    fn discovery_prunes_interface_host_routes() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![iface("mesh3", 3, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![
            via_iface("44.40.0.0/32", "mesh3"),
            via_iface("44.40.0.0/16", "mesh3"),
        ];

        e.bootstrap(Instant::now()).unwrap();
        e.model.check_consistency();

        let tunnel = e.model.tunnel(addr("198.51.100.7")).unwrap();
        assert_eq!(tunnel.routes, vec![net("44.40.0.0/16")]);
        assert!(e.model.routes.get(net("44.40.0.0/32")).is_none());
        assert!(e.ifnums.test(3));
        assert!(e.kernel.take_ops().is_empty());
    }

    #[test]
    fn discovered_routes_expire_like_any_other() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![via_iface("44.40.0.0/16", "mesh0")];
        let now = Instant::now();
        e.bootstrap(now).unwrap();
        e.kernel.take_ops();

        e.expire(now + ROUTE_TIMEOUT + Duration::from_secs(1)).unwrap();
        assert!(e.model.tunnels.is_empty());
        assert_eq!(
            e.kernel.take_ops().last(),
            Some(&Op::DownTunnel("mesh0".into()))
        );
    }

    #[test]
    fn gateway_addresses_resolve_through_inner_peers() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![
            via_iface("44.40.0.0/16", "mesh0"),
            RouteRecord {
                net: net("44.41.0.0/16"),
                target: RouteTarget::Gateway(addr("44.40.0.0")),
            },
        ];
        e.bootstrap(Instant::now()).unwrap();
        e.model.check_consistency();
        assert_eq!(e.model.tunnel(addr("198.51.100.7")).unwrap().nref(), 2);
    }

    #[test]
    fn acceptable_route_to_foreign_interface_is_fatal() {
        let mut e = engine(accept_all());
        e.kernel.routes = vec![via_iface("44.40.0.0/16", "eth0")];
        assert!(e.bootstrap(Instant::now()).is_err());
    }

    #[test]
    fn ignored_route_through_managed_tunnel_is_fatal() {
        let mut policy = PrefixMap::new();
        policy.get_or_insert_with(net("0.0.0.0/0"), || Policy::Ignore);
        policy.get_or_insert_with(net("44.0.0.0/8"), || Policy::Accept);
        let mut e = engine(policy);
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![
            via_iface("44.40.0.0/16", "mesh0"),
            via_iface("10.1.0.0/16", "mesh0"),
        ];
        assert!(e.bootstrap(Instant::now()).is_err());
    }

    #[test]
    fn ignored_route_elsewhere_is_skipped() {
        let mut policy = PrefixMap::new();
        policy.get_or_insert_with(net("0.0.0.0/0"), || Policy::Ignore);
        policy.get_or_insert_with(net("44.0.0.0/8"), || Policy::Accept);
        let mut e = engine(policy);
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![
            via_iface("44.40.0.0/16", "mesh0"),
            via_iface("10.1.0.0/16", "eth0"),
        ];
        e.bootstrap(Instant::now()).unwrap();
        assert!(e.model.routes.get(net("10.1.0.0/16")).is_none());
    }

    #[test]
    fn duplicate_tunnels_to_one_peer_are_fatal() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![
            iface("mesh0", 0, "198.51.100.7", "44.40.0.0"),
            iface("mesh1", 1, "198.51.100.7", "44.41.0.0"),
        ];
        assert!(e.bootstrap(Instant::now()).is_err());
    }

    #[test]
    fn tunnel_without_routes_is_collapsed() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.bootstrap(Instant::now()).unwrap();
        assert!(e.model.tunnels.is_empty());
        assert_eq!(
            e.kernel.take_ops(),
            vec![Op::DownTunnel("mesh0".into())]
        );
        assert_eq!(e.ifnums.first_unset(), 0);
    }

    #[test]
    fn tunnel_without_basis_route_is_fatal() {
        let mut e = engine(accept_all());
        e.kernel.ifaces = vec![iface("mesh0", 0, "198.51.100.7", "44.40.0.0")];
        e.kernel.routes = vec![via_iface("44.41.0.0/16", "mesh0")];
        assert!(e.bootstrap(Instant::now()).is_err());
    }

    fn accept_all() -> PrefixMap<Policy> {
        let mut policy = PrefixMap::new();
        policy.get_or_insert_with(net("0.0.0.0/0"), || Policy::Accept);
        policy
    }
}
