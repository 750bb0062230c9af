//! Typed wrappers around the interface-control ioctls.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

// The ipip tunnel ioctls live in the device-private range and are not
// exported by libc.
pub const SIOCGETTUNNEL: libc::c_ulong = 0x89F0;
pub const SIOCADDTUNNEL: libc::c_ulong = 0x89F1;
pub const SIOCDELTUNNEL: libc::c_ulong = 0x89F2;

const IP_DF: u16 = 0x4000;

/// Executes the `ioctl` syscall on the given file descriptor with the
/// provided request.
///
/// # Safety
///
/// The file descriptor must be open and the payload layout must match what
/// the request code expects.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// A control request addressed by interface name (`struct ifreq`). The
/// payload MUST be `#[repr(C)]` and at least as large as the request code's
/// expectation.
#[repr(C)]
pub struct Request<P> {
    name: [libc::c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

impl<P> Request<P> {
    pub fn new(name: &str, payload: P) -> Self {
        Self {
            name: encode_name(name),
            payload,
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }
}

fn encode_name(name: &str) -> [libc::c_uchar; libc::IF_NAMESIZE] {
    let bytes = name.as_bytes();
    debug_assert!(bytes.len() < libc::IF_NAMESIZE);

    let mut out = [0; libc::IF_NAMESIZE];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Payload of `SIOCGIFFLAGS`/`SIOCSIFFLAGS`.
#[derive(Default)]
#[repr(C)]
pub struct Flags {
    pub flags: libc::c_short,
    // `ifreq` payloads are a union at least the size of a sockaddr.
    _pad: [u8; 14],
}

/// Payload of `SIOCGIFINDEX`.
#[derive(Default)]
#[repr(C)]
pub struct Index {
    pub index: libc::c_int,
    _pad: [u8; 12],
}

pub fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}

pub fn sockaddr_to_addr(sa: &libc::sockaddr_in) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))
}

/// `struct ip_tunnel_parm` from the kernel's tunnel ABI; passed by pointer
/// through the `ifreq` payload slot.
#[repr(C)]
pub struct IpTunnelParm {
    pub name: [libc::c_uchar; libc::IF_NAMESIZE],
    pub link: libc::c_int,
    pub i_flags: u16,
    pub o_flags: u16,
    pub i_key: u32,
    pub o_key: u32,
    pub iph: IpHdr,
}

#[repr(C)]
pub struct IpHdr {
    pub version_ihl: u8,
    pub tos: u8,
    pub tot_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub check: u16,
    pub saddr: u32,
    pub daddr: u32,
}

impl IpTunnelParm {
    /// Parameters for creating an ipip tunnel with the given outer
    /// endpoints. TTL 0 inherits from the payload; DF enables path-MTU
    /// discovery on the outer header.
    pub fn ipip(name: &str, local: Ipv4Addr, remote: Ipv4Addr) -> Self {
        Self {
            name: encode_name(name),
            link: 0,
            i_flags: 0,
            o_flags: 0,
            i_key: 0,
            o_key: 0,
            iph: IpHdr {
                version_ihl: 4 << 4 | 5,
                tos: 0,
                tot_len: 0,
                id: 0,
                frag_off: IP_DF.to_be(),
                ttl: 0,
                protocol: libc::IPPROTO_IPIP as u8,
                check: 0,
                saddr: u32::from(local).to_be(),
                daddr: u32::from(remote).to_be(),
            },
        }
    }

    /// An empty parameter block naming an existing tunnel, for queries and
    /// deletion.
    pub fn named(name: &str) -> Self {
        let mut parm = Self::ipip(name, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        parm.iph.protocol = 0;
        parm.iph.frag_off = 0;
        parm.iph.version_ihl = 0;
        parm
    }

    pub fn outer_local(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.iph.saddr))
    }

    pub fn outer_remote(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.iph.daddr))
    }
}
