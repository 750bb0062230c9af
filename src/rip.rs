//! RIPv2 datagram codec.
//!
//! Just enough of RFC 2453 to consume route advertisements: a 4-byte header
//! followed by 20-byte entries, optionally led by a simple-password
//! authentication entry. Malformed datagrams are data, not program errors.

use std::net::Ipv4Addr;

use thiserror::Error;

const HEADER_LEN: usize = 4;
const ENTRY_LEN: usize = 20;

const CMD_RESPONSE: u8 = 2;
const VERSION: u8 = 2;

/// Wire address-family identifier for IPv4.
const AFI_INET: u16 = 2;
const AFI_AUTH: u16 = 0xFFFF;
const AUTH_SIMPLE: u16 = 2;

pub const PASSWORD_LEN: usize = 16;

/// Metric at and beyond which a destination is unreachable.
pub const INFINITY: u32 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram of {0} bytes is shorter than the RIP header")]
    Truncated(usize),
    #[error("entries must be {ENTRY_LEN} bytes, {0} bytes left over")]
    UnevenLength(usize),
    #[error("not a response (command {0})")]
    NotResponse(u8),
    #[error("unsupported RIP version {0}")]
    BadVersion(u8),
    #[error("expected a simple-password authentication entry")]
    MissingAuth,
    #[error("password mismatch")]
    BadPassword,
}

/// One advertised destination from a response datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Advertised address, host bits and all; normalization is the engine's
    /// business.
    pub addr: Ipv4Addr,
    pub prefix: u8,
    pub next_hop: Ipv4Addr,
    pub metric: u32,
}

/// Parses a response datagram, checking the password when one is
/// configured. Entries that are individually malformed are skipped.
pub fn parse(buf: &[u8], password: Option<&str>) -> Result<Vec<Response>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::Truncated(buf.len()));
    }
    let (command, version) = (buf[0], buf[1]);
    if command != CMD_RESPONSE {
        return Err(ParseError::NotResponse(command));
    }
    if version != VERSION {
        return Err(ParseError::BadVersion(version));
    }

    let mut body = &buf[HEADER_LEN..];
    if body.len() % ENTRY_LEN != 0 {
        return Err(ParseError::UnevenLength(body.len() % ENTRY_LEN));
    }

    if let Some(password) = password {
        let entry = body.get(..ENTRY_LEN).ok_or(ParseError::MissingAuth)?;
        if be16(&entry[0..]) != AFI_AUTH || be16(&entry[2..]) != AUTH_SIMPLE {
            return Err(ParseError::MissingAuth);
        }
        let mut want = [0u8; PASSWORD_LEN];
        want[..password.len()].copy_from_slice(password.as_bytes());
        if entry[4..4 + PASSWORD_LEN] != want {
            return Err(ParseError::BadPassword);
        }
        body = &body[ENTRY_LEN..];
    }

    let mut responses = Vec::with_capacity(body.len() / ENTRY_LEN);
    for entry in body.chunks_exact(ENTRY_LEN) {
        let afi = be16(&entry[0..]);
        if afi == AFI_AUTH {
            // Authentication entries beyond the leading one carry no routes.
            continue;
        }
        if afi != AFI_INET {
            tracing::debug!(afi, "skipping entry with unsupported address family");
            continue;
        }
        let mask = be32(&entry[8..]);
        let prefix = mask.leading_ones() as u8;
        if mask != contiguous_mask(prefix) {
            tracing::debug!(mask = format_args!("{mask:#010x}"), "skipping entry with non-contiguous mask");
            continue;
        }
        responses.push(Response {
            addr: Ipv4Addr::from(be32(&entry[4..])),
            prefix,
            next_hop: Ipv4Addr::from(be32(&entry[12..])),
            metric: be32(&entry[16..]),
        });
    }

    Ok(responses)
}

fn contiguous_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn entry(addr: [u8; 4], mask: [u8; 4], next_hop: [u8; 4], metric: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENTRY_LEN);
        out.extend_from_slice(&AFI_INET.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // route tag
        out.extend_from_slice(&addr);
        out.extend_from_slice(&mask);
        out.extend_from_slice(&next_hop);
        out.extend_from_slice(&metric.to_be_bytes());
        out
    }

    pub fn auth_entry(password: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENTRY_LEN);
        out.extend_from_slice(&AFI_AUTH.to_be_bytes());
        out.extend_from_slice(&AUTH_SIMPLE.to_be_bytes());
        let mut pw = [0u8; PASSWORD_LEN];
        pw[..password.len()].copy_from_slice(password.as_bytes());
        out.extend_from_slice(&pw);
        out
    }

    pub fn datagram(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![CMD_RESPONSE, VERSION, 0, 0];
        for e in entries {
            out.extend_from_slice(e);
        }
        out
    }

    #[test]
    fn parses_a_response() {
        let buf = datagram(&[
            entry([44, 10, 0, 0], [255, 255, 0, 0], [198, 51, 100, 7], 3),
            entry([44, 20, 0, 0], [255, 255, 255, 0], [198, 51, 100, 8], 1),
        ]);
        let responses = parse(&buf, None).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].addr, Ipv4Addr::new(44, 10, 0, 0));
        assert_eq!(responses[0].prefix, 16);
        assert_eq!(responses[0].next_hop, Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(responses[0].metric, 3);
        assert_eq!(responses[1].prefix, 24);
    }

    #[test]
    fn rejects_requests_and_bad_versions() {
        let mut buf = datagram(&[]);
        buf[0] = 1;
        assert_eq!(parse(&buf, None), Err(ParseError::NotResponse(1)));

        let mut buf = datagram(&[]);
        buf[1] = 1;
        assert_eq!(parse(&buf, None), Err(ParseError::BadVersion(1)));
    }

    #[test]
    fn rejects_short_and_uneven_datagrams() {
        assert_eq!(parse(&[2, 2], None), Err(ParseError::Truncated(2)));
        let mut buf = datagram(&[entry([44, 0, 0, 0], [255, 0, 0, 0], [0, 0, 0, 1], 1)]);
        buf.pop();
        assert_eq!(parse(&buf, None), Err(ParseError::UnevenLength(19)));
    }

    #[test]
    fn password_is_enforced_when_configured() {
        let plain = datagram(&[entry([44, 0, 0, 0], [255, 0, 0, 0], [10, 0, 0, 1], 1)]);
        assert_eq!(parse(&plain, Some("sekrit")), Err(ParseError::MissingAuth));

        let wrong = datagram(&[
            auth_entry("wrong"),
            entry([44, 0, 0, 0], [255, 0, 0, 0], [10, 0, 0, 1], 1),
        ]);
        assert_eq!(parse(&wrong, Some("sekrit")), Err(ParseError::BadPassword));

        let good = datagram(&[
            auth_entry("sekrit"),
            entry([44, 0, 0, 0], [255, 0, 0, 0], [10, 0, 0, 1], 1),
        ]);
        assert_eq!(parse(&good, Some("sekrit")).unwrap().len(), 1);

        // Without a configured password the auth entry is skipped unchecked.
        assert_eq!(parse(&good, None).unwrap().len(), 1);
    }

    #[test]
    fn skips_non_contiguous_masks_and_foreign_families() {
        let mut alien = entry([44, 0, 0, 0], [255, 0, 0, 0], [10, 0, 0, 1], 1);
        alien[0..2].copy_from_slice(&10u16.to_be_bytes());
        let buf = datagram(&[
            alien,
            entry([44, 1, 0, 0], [255, 0, 255, 0], [10, 0, 0, 1], 1),
            entry([44, 2, 0, 0], [255, 255, 0, 0], [10, 0, 0, 1], 1),
        ]);
        let responses = parse(&buf, None).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].addr, Ipv4Addr::new(44, 2, 0, 0));
    }

    #[test]
    fn zero_mask_is_the_default_route() {
        let buf = datagram(&[entry([0, 0, 0, 0], [0, 0, 0, 0], [10, 0, 0, 1], 1)]);
        let responses = parse(&buf, None).unwrap();
        assert_eq!(responses[0].prefix, 0);
    }
}
