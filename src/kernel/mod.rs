//! The engine's window on the operating system.
//!
//! Everything the reconciliation engine needs from the kernel goes through
//! the [`Kernel`] trait; the netlink/ioctl vocabulary stays inside the Linux
//! implementation, and tests substitute a recording fake.

use std::net::Ipv4Addr;

use anyhow::Result;
use ip_network::Ipv4Network;

mod ioctl;
pub mod linux;

pub use linux::{LinuxKernel, open_listener};

/// Name prefix of the interfaces this daemon manages.
pub const IFACE_PREFIX: &str = "mesh";

pub fn ifname(ifnum: u32) -> String {
    format!("{IFACE_PREFIX}{ifnum}")
}

/// Everything needed to bring a tunnel interface up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ifname: String,
    pub outer_local: Ipv4Addr,
    pub outer_remote: Ipv4Addr,
    pub inner_local: Ipv4Addr,
    pub inner_remote: Ipv4Addr,
}

/// A managed tunnel interface found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceRecord {
    pub name: String,
    pub ordinal: u32,
    pub outer_local: Ipv4Addr,
    pub outer_remote: Ipv4Addr,
    pub inner_local: Ipv4Addr,
    pub inner_remote: Ipv4Addr,
}

/// Where a discovered route points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// The gateway slot named an interface; resolved to its name.
    Interface(String),
    /// The gateway slot carried an address.
    Gateway(Ipv4Addr),
}

/// A route found in the managed table during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub net: Ipv4Network,
    pub target: RouteTarget,
}

pub trait Kernel {
    /// Creates the tunnel interface, configures the outer endpoints, brings
    /// it up, then assigns the inner point-to-point addressing. The up/inner
    /// ordering is mandatory. Failure is fatal to the daemon.
    fn up_tunnel(&mut self, config: &TunnelConfig) -> Result<()>;

    /// Destroys the tunnel interface.
    fn down_tunnel(&mut self, ifname: &str) -> Result<()>;

    /// Installs the inner point-to-point addressing.
    fn set_inner(&mut self, ifname: &str, local: Ipv4Addr, remote: Ipv4Addr) -> Result<()>;

    /// Deletes the inner addressing; the kernel sweeps away every route
    /// attached to the interface along with it.
    fn clear_inner(&mut self, ifname: &str) -> Result<()>;

    /// Adds a route to `net` through the named interface.
    fn add_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()>;

    /// Replaces the route to `net`; when the routing stack reports that no
    /// such entry exists, falls back to delete-then-add.
    fn change_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()>;

    /// Deletes the route to `net`, tolerating "no such entry".
    fn remove_route(&mut self, net: Ipv4Network) -> Result<()>;

    /// Enumerates managed tunnel interfaces, then every route in the managed
    /// table. Interface references in routes are resolved against the set of
    /// links seen in the first pass.
    fn discover(&mut self) -> Result<(Vec<IfaceRecord>, Vec<RouteRecord>)>;
}

#[cfg(test)]
pub mod fake {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        UpTunnel(TunnelConfig),
        DownTunnel(String),
        SetInner { ifname: String, remote: Ipv4Addr },
        ClearInner(String),
        AddRoute { net: Ipv4Network, ifname: String },
        ChangeRoute { net: Ipv4Network, ifname: String },
        RemoveRoute(Ipv4Network),
    }

    /// Records every call; discovery replays preloaded records.
    #[derive(Default)]
    pub struct FakeKernel {
        pub ops: Vec<Op>,
        pub ifaces: Vec<IfaceRecord>,
        pub routes: Vec<RouteRecord>,
    }

    impl FakeKernel {
        pub fn take_ops(&mut self) -> Vec<Op> {
            std::mem::take(&mut self.ops)
        }
    }

    impl Kernel for FakeKernel {
        fn up_tunnel(&mut self, config: &TunnelConfig) -> Result<()> {
            self.ops.push(Op::UpTunnel(config.clone()));
            Ok(())
        }

        fn down_tunnel(&mut self, ifname: &str) -> Result<()> {
            self.ops.push(Op::DownTunnel(ifname.to_owned()));
            Ok(())
        }

        fn set_inner(&mut self, ifname: &str, _local: Ipv4Addr, remote: Ipv4Addr) -> Result<()> {
            self.ops.push(Op::SetInner {
                ifname: ifname.to_owned(),
                remote,
            });
            Ok(())
        }

        fn clear_inner(&mut self, ifname: &str) -> Result<()> {
            self.ops.push(Op::ClearInner(ifname.to_owned()));
            Ok(())
        }

        fn add_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()> {
            self.ops.push(Op::AddRoute {
                net,
                ifname: ifname.to_owned(),
            });
            Ok(())
        }

        fn change_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()> {
            self.ops.push(Op::ChangeRoute {
                net,
                ifname: ifname.to_owned(),
            });
            Ok(())
        }

        fn remove_route(&mut self, net: Ipv4Network) -> Result<()> {
            self.ops.push(Op::RemoveRoute(net));
            Ok(())
        }

        fn discover(&mut self) -> Result<(Vec<IfaceRecord>, Vec<RouteRecord>)> {
            Ok((self.ifaces.clone(), self.routes.clone()))
        }
    }
}
