//! Reconciliation of advertisements against the model and the kernel.
//!
//! One advertisement at a time: drop filters, tunnel allocation, route
//! linkage, then kernel mutation. The rebase/collapse machinery keeps the
//! tunnel reference counts and the basis-route invariant intact while
//! routes come and go.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use ip_network::Ipv4Network;

use crate::bitset::BitSet;
use crate::kernel::{self, Kernel};
use crate::model::{Model, Policy, Route, Tunnel, host_net};
use crate::prefix_map::PrefixMap;
use crate::rip;

/// How long an advertised route stays alive without being refreshed. Two
/// advertisement intervals on the usual five-minute cadence.
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct Settings {
    pub outer_local: Ipv4Addr,
    pub inner_local: Ipv4Addr,
    pub route_timeout: Duration,
    pub static_ifnums: HashSet<u32>,
}

pub struct Engine<K> {
    pub(crate) kernel: K,
    pub(crate) model: Model,
    pub(crate) policy: PrefixMap<Policy>,
    pub(crate) ifnums: BitSet,
    pub(crate) outer_local: Ipv4Addr,
    pub(crate) inner_local: Ipv4Addr,
    pub(crate) route_timeout: Duration,
    pub(crate) static_ifnums: HashSet<u32>,
}

enum Disposition {
    New,
    Moved(Ipv4Addr),
    Refresh,
}

impl<K: Kernel> Engine<K> {
    pub fn new(kernel: K, policy: PrefixMap<Policy>, settings: Settings) -> Self {
        let mut ifnums = BitSet::new();
        for ifnum in &settings.static_ifnums {
            ifnums.set(*ifnum);
        }
        Self {
            kernel,
            model: Model::new(),
            policy,
            ifnums,
            outer_local: settings.outer_local,
            inner_local: settings.inner_local,
            route_timeout: settings.route_timeout,
            static_ifnums: settings.static_ifnums,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Applies one advertised destination.
    pub fn process_response(&mut self, resp: &rip::Response, now: Instant) -> Result<()> {
        let net = Ipv4Network::new_truncate(resp.addr, resp.prefix)
            .context("advertisement carries an impossible prefix length")?;
        if net.network_address() != resp.addr {
            tracing::warn!(advertised = %resp.addr, %net, "host bits set in advertised network, normalizing");
        }

        if resp.metric >= rip::INFINITY {
            tracing::debug!(%net, metric = resp.metric, "dropping unreachable advertisement");
            return Ok(());
        }
        if resp.next_hop.is_unspecified() || resp.next_hop == self.outer_local {
            tracing::debug!(%net, next_hop = %resp.next_hop, "dropping advertisement pointing at ourselves");
            return Ok(());
        }
        if net.contains(resp.next_hop) {
            tracing::debug!(%net, next_hop = %resp.next_hop, "dropping advertisement with next hop inside the advertised network");
            return Ok(());
        }
        if !self.accepts(net) {
            tracing::debug!(%net, "dropping advertisement outside the accept policy");
            return Ok(());
        }

        let gateway = resp.next_hop;
        self.ensure_tunnel(gateway, net)?;

        let expires = now + self.route_timeout;
        let disposition = match self.model.routes.get(net) {
            None => Disposition::New,
            Some(route) if route.gateway != gateway => Disposition::Moved(route.gateway),
            Some(_) => Disposition::Refresh,
        };
        match disposition {
            Disposition::New => {
                // A broader route through the same tunnel already delivers
                // this traffic.
                if let Some((covering, route)) =
                    self.model.routes.nearest(net.network_address(), net.netmask())
                    && route.gateway == gateway
                {
                    tracing::debug!(%net, %covering, "dropping advertisement covered on the same tunnel");
                    return Ok(());
                }
                self.kernel_add_route(net, gateway)?;
                self.link(net, gateway, expires)?;
                tracing::info!(%net, %gateway, "route added");
            }
            Disposition::Moved(previous) => {
                self.kernel_change_route(net, previous, gateway)?;
                self.model.unlink(net, previous);
                self.collapse(previous)?;
                self.link(net, gateway, expires)?;
                tracing::info!(%net, from = %previous, to = %gateway, "route moved");
            }
            Disposition::Refresh => {
                if let Some(route) = self.model.routes.get_mut(net) {
                    route.expires = expires;
                }
            }
        }
        Ok(())
    }

    /// Removes every route whose deadline has passed, tearing down tunnels
    /// left without references.
    pub fn expire(&mut self, now: Instant) -> Result<()> {
        let doomed: Vec<Ipv4Network> = self
            .model
            .routes
            .iter()
            .filter(|(_, route)| route.expires <= now)
            .map(|(net, _)| net)
            .collect();

        for net in doomed {
            let Some(route) = self.model.routes.remove(net) else {
                continue;
            };
            let gateway = route.gateway;
            self.kernel_remove_route(net, gateway)?;
            self.model.unlink(net, gateway);
            self.collapse(gateway)?;
            tracing::info!(%net, %gateway, "route expired");
        }
        Ok(())
    }

    /// Tears down a tunnel once nothing references it. Static tunnels keep
    /// their interface and their map entry for later reuse.
    pub(crate) fn collapse(&mut self, gateway: Ipv4Addr) -> Result<()> {
        let Some(tunnel) = self.model.tunnel(gateway) else {
            return Ok(());
        };
        if tunnel.nref() > 0 {
            return Ok(());
        }
        if tunnel.static_if {
            tracing::debug!(ifname = %tunnel.ifname, "static tunnel idle, leaving interface in place");
            return Ok(());
        }
        let (ifname, ifnum) = (tunnel.ifname.clone(), tunnel.ifnum);
        self.model.tunnels.remove(host_net(gateway));
        self.kernel
            .down_tunnel(&ifname)
            .with_context(|| format!("failed to tear down {ifname}"))?;
        self.ifnums.clear(ifnum);
        tracing::info!(%ifname, %gateway, "tunnel torn down");
        Ok(())
    }

    /// Drops routes that lie inside another route on the same tunnel; these
    /// are the host routes the kernel inserts for the interface's own peer
    /// address. Bootstrap only; the kernel's copy is owned by the interface
    /// addressing and is left alone.
    pub(crate) fn fix_overlaps(&mut self) {
        let tunnels: Vec<(Ipv4Addr, Vec<Ipv4Network>)> = self
            .model
            .tunnels
            .iter()
            .map(|(_, t)| (t.outer_remote, t.routes.clone()))
            .collect();

        for (gateway, nets) in tunnels {
            let mut by_prefix: PrefixMap<()> = PrefixMap::new();
            for net in nets {
                by_prefix.get_or_insert_with(net, || ());
            }
            let mut covering: Option<Ipv4Network> = None;
            let mut redundant = Vec::new();
            for (net, _) in by_prefix.iter() {
                match covering {
                    Some(c) if c.netmask() < net.netmask() && c.contains(net.network_address()) => {
                        redundant.push(net);
                    }
                    _ => covering = Some(net),
                }
            }
            for net in redundant {
                self.model.routes.remove(net);
                self.model.unlink(net, gateway);
                tracing::debug!(%net, %gateway, "dropped redundant overlapping route");
            }
        }
    }

    fn accepts(&self, net: Ipv4Network) -> bool {
        matches!(
            self.policy.nearest(net.network_address(), net.netmask()),
            Some((_, Policy::Accept))
        )
    }

    /// Creates the tunnel to `gateway` if none exists; `net` seeds the inner
    /// peer address.
    fn ensure_tunnel(&mut self, gateway: Ipv4Addr, net: Ipv4Network) -> Result<()> {
        if self.model.tunnel(gateway).is_some() {
            return Ok(());
        }
        let ifnum = self.ifnums.first_unset();
        debug_assert!(!self.ifnums.test(ifnum));
        self.ifnums.set(ifnum);
        let tunnel = Tunnel {
            ifname: kernel::ifname(ifnum),
            ifnum,
            outer_local: self.outer_local,
            outer_remote: gateway,
            inner_local: self.inner_local,
            inner_remote: net.network_address(),
            routes: Vec::new(),
            static_if: false,
        };
        self.kernel
            .up_tunnel(&tunnel.config())
            .with_context(|| format!("failed to bring up tunnel {}", tunnel.ifname))?;
        tracing::info!(ifname = %tunnel.ifname, outer_remote = %gateway, "tunnel created");
        self.model
            .tunnels
            .get_or_insert_with(host_net(gateway), || tunnel);
        Ok(())
    }

    /// Stores the route and links it to its tunnel. A tunnel that sat empty
    /// (static survivor) gets this route as its new basis.
    fn link(&mut self, net: Ipv4Network, gateway: Ipv4Addr, expires: Instant) -> Result<()> {
        let tunnel = self
            .model
            .tunnel(gateway)
            .with_context(|| format!("no tunnel for gateway {gateway}"))?;
        if tunnel.routes.is_empty() && tunnel.inner_remote != net.network_address() {
            let (ifname, inner_local) = (tunnel.ifname.clone(), tunnel.inner_local);
            self.kernel
                .set_inner(&ifname, inner_local, net.network_address())
                .with_context(|| format!("failed to re-address idle tunnel {ifname}"))?;
            if let Some(tunnel) = self.model.tunnel_mut(gateway) {
                tunnel.inner_remote = net.network_address();
            }
        }

        let (route, _) = self.model.routes.get_or_insert_with(net, || Route {
            net,
            gateway,
            expires,
        });
        route.gateway = gateway;
        route.expires = expires;

        let tunnel = self
            .model
            .tunnel_mut(gateway)
            .with_context(|| format!("no tunnel for gateway {gateway}"))?;
        if !tunnel.routes.contains(&net) {
            tunnel.routes.push(net);
        }
        Ok(())
    }

    /// Installs `net` through the tunnel to `gateway`, unless it duplicates
    /// the host route the kernel inserted for the tunnel's own peer.
    fn kernel_add_route(&mut self, net: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        let (ifname, inner_remote) = self.tunnel_ref(gateway)?;
        if net.netmask() == 32 && net.network_address() == inner_remote {
            tracing::debug!(%net, "skipping add of the interface's own host route");
            return Ok(());
        }
        self.kernel.add_route(net, &ifname)
    }

    /// Moves `net` from the tunnel to `previous` onto the one to `gateway`,
    /// rebasing the old tunnel first if `net` was its basis.
    fn kernel_change_route(
        &mut self,
        net: Ipv4Network,
        previous: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        self.rebase(previous, net)?;
        let (ifname, _) = self.tunnel_ref(gateway)?;
        self.kernel.change_route(net, &ifname)
    }

    /// Deletes `net` from the kernel, rebasing its tunnel first if it was
    /// the basis. After a rebase the entry is usually already gone; the
    /// adapter tolerates that.
    fn kernel_remove_route(&mut self, net: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        self.rebase(gateway, net)?;
        self.kernel.remove_route(net)
    }

    /// Moves a tunnel's inner addressing off the disappearing basis route.
    ///
    /// Deleting the inner addressing sweeps every attached kernel route, so
    /// all surviving routes are re-added afterwards. A no-op whenever `lost`
    /// is not the current basis, which also makes a second invocation for
    /// the same loss harmless.
    fn rebase(&mut self, gateway: Ipv4Addr, lost: Ipv4Network) -> Result<()> {
        let Some(tunnel) = self.model.tunnel(gateway) else {
            return Ok(());
        };
        if tunnel.inner_remote != lost.network_address() {
            return Ok(());
        }

        let ifname = tunnel.ifname.clone();
        let inner_local = tunnel.inner_local;
        let survivors: Vec<Ipv4Network> =
            tunnel.routes.iter().copied().filter(|k| *k != lost).collect();

        self.kernel
            .clear_inner(&ifname)
            .with_context(|| format!("failed to strip addressing from {ifname}"))?;

        let Some(basis) = survivors.first().copied() else {
            // Last route on the tunnel; the caller collapses it momentarily.
            return Ok(());
        };
        let basis_addr = basis.network_address();
        self.kernel
            .set_inner(&ifname, inner_local, basis_addr)
            .with_context(|| format!("failed to rebase {ifname} onto {basis_addr}"))?;
        if let Some(tunnel) = self.model.tunnel_mut(gateway) {
            tunnel.inner_remote = basis_addr;
        }
        for net in survivors {
            if net.netmask() == 32 && net.network_address() == basis_addr {
                continue;
            }
            self.kernel
                .add_route(net, &ifname)
                .with_context(|| format!("failed to reinstall {net} after rebasing {ifname}"))?;
        }
        tracing::info!(%ifname, basis = %basis_addr, "tunnel rebased");
        Ok(())
    }

    fn tunnel_ref(&self, gateway: Ipv4Addr) -> Result<(String, Ipv4Addr)> {
        self.model
            .tunnel(gateway)
            .map(|t| (t.ifname.clone(), t.inner_remote))
            .with_context(|| format!("no tunnel for gateway {gateway}"))
    }
}
