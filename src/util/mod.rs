//! Utility Functions Module
//!
//! Small helpers shared by the protocol layers, the workflow and the CLI:
//! dotted-quad validation, device address parsing and hex formatting for logs.

pub mod enum_macros;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::transport::constants::BACNET_IP_PORT;

/// Parse a dotted-quad IPv4 address.
///
/// The text must be exactly four `.`-separated groups of ASCII digits, each
/// no larger than 255. Leading zeros are accepted (`"000.000.000.000"` is how
/// some controllers store an unset address); signs, whitespace and empty
/// groups are not.
pub fn parse_ipv4(text: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value = part
            .bytes()
            .try_fold(0u32, |acc, b| acc.checked_mul(10)?.checked_add((b - b'0') as u32))?;
        *octet = u8::try_from(value).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

/// True when `text` is a dotted-quad IPv4 address
pub fn is_valid_ipv4(text: &str) -> bool {
    parse_ipv4(text).is_some()
}

/// Parse a BACnet/IP device address: `a.b.c.d` or `a.b.c.d:port`.
/// The port defaults to 47808.
pub fn parse_device_address(text: &str) -> Option<SocketAddr> {
    let (host, port) = match text.split_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (text, BACNET_IP_PORT),
    };
    parse_ipv4(host).map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Space-separated hex for log output
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(1)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}
