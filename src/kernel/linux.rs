//! Linux implementation of the kernel adapter.
//!
//! Routes go through a synchronous `NETLINK_ROUTE` socket; tunnel interface
//! lifecycle and addressing go through `AF_INET` ioctls. All wire addresses
//! are converted to network byte order here and nowhere else.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;

use anyhow::{Context as _, Result};
use ip_network::Ipv4Network;
use netlink_packet_core::{
    ErrorMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
    NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::Socket as NetlinkSocket;
use netlink_sys::SocketAddr as NetlinkAddr;

use super::ioctl::{self, IpTunnelParm, Request};
use super::{IFACE_PREFIX, IfaceRecord, Kernel, RouteRecord, RouteTarget, TunnelConfig};

/// RIP listens on this multicast group and port.
pub const RIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);
pub const RIP_PORT: u16 = 520;

/// Parent device the ipip tunnel ioctls are addressed to.
const TUNNEL_BASE_DEV: &str = "tunl0";

pub struct LinuxKernel {
    route_sock: NetlinkSocket,
    // AF_INET datagram socket carrying the interface ioctls.
    ctl: socket2::Socket,
    rtable: u32,
    seq: u32,
}

impl LinuxKernel {
    /// Creates and retains the control and routing sockets for the given
    /// route table.
    pub fn new(rtable: u32) -> Result<Self> {
        let mut route_sock = NetlinkSocket::new(netlink_sys::constants::NETLINK_ROUTE)
            .context("failed to open netlink route socket")?;
        route_sock
            .bind(&NetlinkAddr::new(0, 0))
            .context("failed to bind netlink route socket")?;

        let ctl = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
            .context("failed to open interface control socket")?;

        Ok(Self {
            route_sock,
            ctl,
            rtable,
            seq: 0,
        })
    }

    // The sequence number is diagnostic only; it wraps at INT_MAX.
    fn next_seq(&mut self) -> u32 {
        self.seq = if self.seq >= i32::MAX as u32 {
            1
        } else {
            self.seq + 1
        };
        self.seq
    }

    /// Sends one request and waits for its ACK.
    fn acked(&mut self, payload: RouteNetlinkMessage, flags: u16) -> io::Result<()> {
        let mut msg = NetlinkMessage::from(payload);
        msg.header.flags = NLM_F_REQUEST | NLM_F_ACK | flags;
        msg.header.sequence_number = self.next_seq();
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        if self.route_sock.send(&buf, 0)? != buf.len() {
            return Err(io::Error::other("short write on netlink socket"));
        }

        let (rbuf, _) = self.route_sock.recv_from_full()?;
        let mut view = &rbuf[..];
        while !view.is_empty() {
            let resp =
                NetlinkMessage::<RouteNetlinkMessage>::deserialize(view).map_err(io::Error::other)?;
            let len = resp.header.length as usize;
            if len == 0 || len > view.len() {
                return Err(io::Error::other("malformed netlink message length"));
            }
            if let NetlinkPayload::Error(e) = resp.payload {
                return ack_to_result(&e);
            }
            view = &view[len..];
        }
        Err(io::Error::other("netlink request was not acknowledged"))
    }

    /// Sends a dump request and collects every inner message of the
    /// multi-part response.
    fn dump(&mut self, payload: RouteNetlinkMessage) -> io::Result<Vec<RouteNetlinkMessage>> {
        let mut msg = NetlinkMessage::from(payload);
        msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        msg.header.sequence_number = self.next_seq();
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        if self.route_sock.send(&buf, 0)? != buf.len() {
            return Err(io::Error::other("short write on netlink socket"));
        }

        let mut out = Vec::new();
        'recv: loop {
            let (rbuf, _) = self.route_sock.recv_from_full()?;
            let mut view = &rbuf[..];
            while !view.is_empty() {
                let resp = NetlinkMessage::<RouteNetlinkMessage>::deserialize(view)
                    .map_err(io::Error::other)?;
                let len = resp.header.length as usize;
                if len == 0 || len > view.len() {
                    return Err(io::Error::other("malformed netlink message length"));
                }
                match resp.payload {
                    NetlinkPayload::Done(_) => break 'recv,
                    NetlinkPayload::Error(e) => {
                        ack_to_result(&e)?;
                    }
                    NetlinkPayload::InnerMessage(inner) => out.push(inner),
                    _ => {}
                }
                view = &view[len..];
            }
        }
        Ok(out)
    }

    fn route_message(&self, net: Ipv4Network, ifindex: Option<u32>) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        msg.header.destination_prefix_length = net.netmask();
        msg.header.protocol = RouteProtocol::Static;
        msg.header.scope = RouteScope::Link;
        msg.header.kind = RouteType::Unicast;
        msg.header.table = u8::try_from(self.rtable).unwrap_or(0);
        msg.attributes.push(RouteAttribute::Table(self.rtable));
        msg.attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(
                net.network_address(),
            )));
        if let Some(ifindex) = ifindex {
            msg.attributes.push(RouteAttribute::Oif(ifindex));
        }
        msg
    }

    fn delete_route(&mut self, net: Ipv4Network) -> io::Result<()> {
        let mut msg = self.route_message(net, None);
        // Match on destination and table only.
        msg.header.protocol = RouteProtocol::Unspec;
        match self.acked(RouteNetlinkMessage::DelRoute(msg), 0) {
            Err(e) if is_not_found(&e) => {
                tracing::debug!(%net, "route to delete was already gone");
                Ok(())
            }
            other => other,
        }
    }

    fn ifindex(&self, ifname: &str) -> Result<u32> {
        let mut req = Request::new(ifname, ioctl::Index::default());
        // Safety: the control socket is open and `Index` matches SIOCGIFINDEX.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), libc::SIOCGIFINDEX, &mut req) }
            .with_context(|| format!("failed to resolve interface index of {ifname}"))?;
        Ok(req.payload().index as u32)
    }

    fn get_addr(&self, ifname: &str, code: libc::c_ulong) -> io::Result<Ipv4Addr> {
        let mut req = Request::new(ifname, ioctl::sockaddr_in(Ipv4Addr::UNSPECIFIED));
        // Safety: the control socket is open and the payload is a sockaddr.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), code, &mut req) }?;
        Ok(ioctl::sockaddr_to_addr(req.payload()))
    }

    fn set_addr(&self, ifname: &str, code: libc::c_ulong, addr: Ipv4Addr) -> io::Result<()> {
        let mut req = Request::new(ifname, ioctl::sockaddr_in(addr));
        // Safety: the control socket is open and the payload is a sockaddr.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), code, &mut req) }
    }

    fn set_running(&self, ifname: &str) -> io::Result<()> {
        let mut req = Request::new(ifname, ioctl::Flags::default());
        let fd = self.ctl.as_raw_fd();
        // Safety: the control socket is open and `Flags` matches SIOC?IFFLAGS.
        unsafe {
            ioctl::exec(fd, libc::SIOCGIFFLAGS, &mut req)?;
            req.payload_mut().flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            ioctl::exec(fd, libc::SIOCSIFFLAGS, &mut req)
        }
    }

    fn tunnel_parm(&self, ifname: &str) -> io::Result<IpTunnelParm> {
        let mut parm = IpTunnelParm::named(ifname);
        let mut req = Request::new(ifname, std::ptr::from_mut(&mut parm));
        // Safety: the control socket is open; the payload slot carries the
        // parameter-block pointer the tunnel ioctls expect.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), ioctl::SIOCGETTUNNEL, &mut req) }?;
        Ok(parm)
    }
}

impl Kernel for LinuxKernel {
    fn up_tunnel(&mut self, config: &TunnelConfig) -> Result<()> {
        let name = config.ifname.as_str();
        let mut parm = IpTunnelParm::ipip(name, config.outer_local, config.outer_remote);
        let mut req = Request::new(TUNNEL_BASE_DEV, std::ptr::from_mut(&mut parm));
        // Safety: see `tunnel_parm`.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), ioctl::SIOCADDTUNNEL, &mut req) }
            .with_context(|| format!("failed to create {name}; is the ipip module loaded?"))?;

        // The interface must be up and running before it gets its inner
        // addressing.
        self.set_running(name)
            .with_context(|| format!("failed to bring up {name}"))?;
        self.set_inner(name, config.inner_local, config.inner_remote)
    }

    fn down_tunnel(&mut self, ifname: &str) -> Result<()> {
        let mut parm = IpTunnelParm::named(ifname);
        let mut req = Request::new(ifname, std::ptr::from_mut(&mut parm));
        // Safety: see `tunnel_parm`.
        unsafe { ioctl::exec(self.ctl.as_raw_fd(), ioctl::SIOCDELTUNNEL, &mut req) }
            .with_context(|| format!("failed to destroy {ifname}"))
    }

    fn set_inner(&mut self, ifname: &str, local: Ipv4Addr, remote: Ipv4Addr) -> Result<()> {
        self.set_addr(ifname, libc::SIOCSIFADDR, local)
            .with_context(|| format!("failed to set inner address of {ifname}"))?;
        self.set_addr(ifname, libc::SIOCSIFDSTADDR, remote)
            .with_context(|| format!("failed to set inner peer of {ifname}"))
    }

    fn clear_inner(&mut self, ifname: &str) -> Result<()> {
        // An unspecified address deletes the primary; the peer and the
        // attached routes go with it.
        self.set_addr(ifname, libc::SIOCDIFADDR, Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to delete inner address of {ifname}"))
    }

    fn add_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()> {
        let ifindex = self.ifindex(ifname)?;
        let msg = self.route_message(net, Some(ifindex));
        self.acked(
            RouteNetlinkMessage::NewRoute(msg),
            NLM_F_CREATE | NLM_F_EXCL,
        )
        .with_context(|| format!("failed to add route {net} via {ifname}"))
    }

    fn change_route(&mut self, net: Ipv4Network, ifname: &str) -> Result<()> {
        let ifindex = self.ifindex(ifname)?;
        let msg = self.route_message(net, Some(ifindex));
        match self.acked(RouteNetlinkMessage::NewRoute(msg.clone()), NLM_F_REPLACE) {
            Err(e) if is_not_found(&e) => {
                // The entry vanished underneath us; fall back to a fresh add.
                tracing::debug!(%net, "route to change does not exist, re-adding");
                self.delete_route(net)
                    .with_context(|| format!("failed to delete route {net}"))?;
                self.acked(
                    RouteNetlinkMessage::NewRoute(msg),
                    NLM_F_CREATE | NLM_F_EXCL,
                )
                .with_context(|| format!("failed to re-add route {net} via {ifname}"))
            }
            other => other.with_context(|| format!("failed to change route {net} via {ifname}")),
        }
    }

    fn remove_route(&mut self, net: Ipv4Network) -> Result<()> {
        self.delete_route(net)
            .with_context(|| format!("failed to remove route {net}"))
    }

    fn discover(&mut self) -> Result<(Vec<IfaceRecord>, Vec<RouteRecord>)> {
        let links = self
            .dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))
            .context("failed to enumerate interfaces")?;

        let mut names = HashMap::new();
        for msg in links {
            let RouteNetlinkMessage::NewLink(link) = msg else {
                continue;
            };
            let name = link.attributes.iter().find_map(|a| match a {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            });
            if let Some(name) = name {
                names.insert(link.header.index, name);
            }
        }

        let mut ifaces = Vec::new();
        for name in names.values() {
            let Some(ordinal) = name
                .strip_prefix(IFACE_PREFIX)
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            let parm = self
                .tunnel_parm(name)
                .with_context(|| format!("failed to read tunnel parameters of {name}"))?;
            let inner_local = self
                .get_addr(name, libc::SIOCGIFADDR)
                .with_context(|| format!("managed interface {name} has no inner address"))?;
            let inner_remote = self
                .get_addr(name, libc::SIOCGIFDSTADDR)
                .with_context(|| format!("managed interface {name} has no inner peer"))?;
            ifaces.push(IfaceRecord {
                name: name.clone(),
                ordinal,
                outer_local: parm.outer_local(),
                outer_remote: parm.outer_remote(),
                inner_local,
                inner_remote,
            });
        }

        let mut filter = RouteMessage::default();
        filter.header.address_family = AddressFamily::Inet;
        let dumped = self
            .dump(RouteNetlinkMessage::GetRoute(filter))
            .context("failed to enumerate routes")?;

        let mut routes = Vec::new();
        for msg in dumped {
            let RouteNetlinkMessage::NewRoute(route) = msg else {
                continue;
            };
            if route.header.address_family != AddressFamily::Inet
                || route.header.kind != RouteType::Unicast
            {
                continue;
            }
            let table = route
                .attributes
                .iter()
                .find_map(|a| match a {
                    RouteAttribute::Table(t) => Some(*t),
                    _ => None,
                })
                .unwrap_or(u32::from(route.header.table));
            if table != self.rtable {
                continue;
            }

            let mut dest = Ipv4Addr::UNSPECIFIED;
            let mut gateway = None;
            let mut oif = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Destination(RouteAddress::Inet(addr)) => dest = *addr,
                    RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
                    RouteAttribute::Oif(idx) => oif = Some(*idx),
                    _ => {}
                }
            }
            let net = Ipv4Network::new_truncate(dest, route.header.destination_prefix_length)
                .context("kernel returned an impossible prefix length")?;
            let target = if let Some(gateway) = gateway {
                RouteTarget::Gateway(gateway)
            } else if let Some(oif) = oif {
                let name = names
                    .get(&oif)
                    .with_context(|| format!("route {net} references unknown interface {oif}"))?;
                RouteTarget::Interface(name.clone())
            } else {
                tracing::debug!(%net, "skipping route with neither gateway nor interface");
                continue;
            };
            routes.push(RouteRecord { net, target });
        }

        Ok((ifaces, routes))
    }
}

fn ack_to_result(e: &ErrorMessage) -> io::Result<()> {
    match e.raw_code() {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(-code)),
    }
}

/// The routing stack's two spellings of "no such entry".
fn is_not_found(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ESRCH) | Some(libc::ENOENT)
    )
}

/// Opens the advertisement listener: port 520 on all interfaces, joined to
/// the RIP multicast group, with address reuse. `mark` is applied as
/// `SO_MARK` so policy rules can steer the socket's traffic.
pub fn open_listener(mark: Option<u32>) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create listener socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    if let Some(mark) = mark {
        socket
            .set_mark(mark)
            .with_context(|| format!("failed to set SO_MARK {mark}"))?;
    }
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, RIP_PORT).into())
        .with_context(|| format!("failed to bind UDP port {RIP_PORT}"))?;
    socket
        .join_multicast_v4(&RIP_GROUP, &Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("failed to join multicast group {RIP_GROUP}"))?;

    Ok(socket.into())
}
