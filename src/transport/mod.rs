//! BACnet/IP Transport Module
//!
//! The BACnet Virtual Link Layer (BVLL) framing that wraps every NPDU sent
//! over UDP, plus the socket plumbing the client needs: binding a reusable
//! broadcast-capable socket and working out where local broadcasts go.
//!
//! # Overview
//!
//! Every BACnet/IP datagram starts with a four octet BVLL header:
//!
//! ```text
//! 0x81 | function | length (u16, big-endian, header included)
//! ```
//!
//! Devices behind a BBMD answer with `Forwarded-NPDU`, which carries the
//! original sender's address ahead of the NPDU. [`BvllMessage::npdu`] hides
//! that difference from callers.
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::transport::{BvllFunction, BvllMessage};
//!
//! let message = BvllMessage::new(BvllFunction::OriginalUnicastNpdu, vec![0x01, 0x04]);
//! assert_eq!(message.encode(), vec![0x81, 0x0A, 0x00, 0x06, 0x01, 0x04]);
//! ```

use std::error::Error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug)]
pub enum TransportError {
    /// I/O error
    IoError(std::io::Error),
    /// Invalid BVLL format
    InvalidBvll(String),
    /// BBMD refused the foreign device registration (BVLC result code)
    RegistrationFailed(u16),
    /// Invalid transport configuration
    InvalidConfiguration(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::IoError(e) => write!(f, "I/O error: {}", e),
            TransportError::InvalidBvll(msg) => write!(f, "Invalid BVLL: {}", msg),
            TransportError::RegistrationFailed(code) => {
                write!(f, "Foreign device registration failed (result 0x{:04X})", code)
            }
            TransportError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::IoError(error)
    }
}

/// BVLL type octet for BACnet/IP
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// BVLL function codes for BACnet/IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    /// Result of a BVLL operation
    Result = 0x00,
    WriteBroadcastDistributionTable = 0x01,
    ReadBroadcastDistributionTable = 0x02,
    ReadBroadcastDistributionTableAck = 0x03,
    /// NPDU relayed by a BBMD, prefixed with the originator's address
    ForwardedNpdu = 0x04,
    /// Register as foreign device
    RegisterForeignDevice = 0x05,
    ReadForeignDeviceTable = 0x06,
    ReadForeignDeviceTableAck = 0x07,
    DeleteForeignDeviceTableEntry = 0x08,
    /// Ask a BBMD to broadcast on our behalf (foreign devices only)
    DistributeBroadcastToNetwork = 0x09,
    /// Pass NPDU to remote device
    OriginalUnicastNpdu = 0x0A,
    /// Broadcast NPDU to local network
    OriginalBroadcastNpdu = 0x0B,
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvllFunction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        let function = match value {
            0x00 => BvllFunction::Result,
            0x01 => BvllFunction::WriteBroadcastDistributionTable,
            0x02 => BvllFunction::ReadBroadcastDistributionTable,
            0x03 => BvllFunction::ReadBroadcastDistributionTableAck,
            0x04 => BvllFunction::ForwardedNpdu,
            0x05 => BvllFunction::RegisterForeignDevice,
            0x06 => BvllFunction::ReadForeignDeviceTable,
            0x07 => BvllFunction::ReadForeignDeviceTableAck,
            0x08 => BvllFunction::DeleteForeignDeviceTableEntry,
            0x09 => BvllFunction::DistributeBroadcastToNetwork,
            0x0A => BvllFunction::OriginalUnicastNpdu,
            0x0B => BvllFunction::OriginalBroadcastNpdu,
            0x0C => BvllFunction::SecureBvll,
            other => {
                return Err(TransportError::InvalidBvll(format!(
                    "Invalid BVLL function 0x{:02X}",
                    other
                )))
            }
        };
        Ok(function)
    }
}

/// BACnet/IP specific constants
pub mod constants {
    /// Default BACnet/IP UDP port
    pub const BACNET_IP_PORT: u16 = 0xBAC0; // 47808

    /// Maximum BVLL length
    pub const MAX_BVLL_LENGTH: usize = 1497;

    /// BVLL header size
    pub const BVLL_HEADER_SIZE: usize = 4;

    /// Default foreign device TTL (seconds)
    pub const DEFAULT_FD_TTL: u16 = 900; // 15 minutes

    /// BVLC result code for a successful operation
    pub const BVLC_RESULT_SUCCESSFUL: u16 = 0x0000;

    /// BVLC result code for a refused foreign device registration
    pub const BVLC_RESULT_REGISTER_FD_NAK: u16 = 0x0030;
}

/// BVLL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvllHeader {
    /// Function code
    pub function: BvllFunction,
    /// Total length including header
    pub length: u16,
}

impl BvllHeader {
    pub fn new(function: BvllFunction, length: u16) -> Self {
        Self { function, length }
    }

    pub fn encode(&self) -> [u8; 4] {
        let [high, low] = self.length.to_be_bytes();
        [BVLL_TYPE_BACNET_IP, self.function as u8, high, low]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < constants::BVLL_HEADER_SIZE {
            return Err(TransportError::InvalidBvll("Header too short".into()));
        }
        if data[0] != BVLL_TYPE_BACNET_IP {
            return Err(TransportError::InvalidBvll(format!(
                "Invalid BVLL type 0x{:02X}",
                data[0]
            )));
        }
        let function = BvllFunction::try_from(data[1])?;
        let length = u16::from_be_bytes([data[2], data[3]]);
        if (length as usize) < constants::BVLL_HEADER_SIZE {
            return Err(TransportError::InvalidBvll(format!("Invalid length {}", length)));
        }
        Ok(Self { function, length })
    }
}

/// BVLL message containing header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllMessage {
    pub header: BvllHeader,
    /// Everything after the header
    pub data: Vec<u8>,
}

impl BvllMessage {
    pub fn new(function: BvllFunction, data: Vec<u8>) -> Self {
        let length = (constants::BVLL_HEADER_SIZE + data.len()) as u16;
        Self {
            header: BvllHeader::new(function, length),
            data,
        }
    }

    /// Register-Foreign-Device with the given time-to-live
    pub fn register_foreign_device(ttl: u16) -> Self {
        Self::new(BvllFunction::RegisterForeignDevice, ttl.to_be_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(constants::BVLL_HEADER_SIZE + self.data.len());
        result.extend_from_slice(&self.header.encode());
        result.extend_from_slice(&self.data);
        result
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BvllHeader::decode(data)?;
        let payload = data
            .get(constants::BVLL_HEADER_SIZE..header.length as usize)
            .ok_or_else(|| TransportError::InvalidBvll("Message too short".into()))?;
        Ok(Self {
            header,
            data: payload.to_vec(),
        })
    }

    /// The NPDU carried by this message, if it carries one
    pub fn npdu(&self) -> Option<&[u8]> {
        match self.header.function {
            BvllFunction::OriginalUnicastNpdu
            | BvllFunction::OriginalBroadcastNpdu
            | BvllFunction::DistributeBroadcastToNetwork => Some(&self.data),
            BvllFunction::ForwardedNpdu => self.data.get(6..),
            _ => None,
        }
    }

    /// Originating device of a Forwarded-NPDU
    pub fn forwarded_from(&self) -> Option<SocketAddr> {
        if self.header.function != BvllFunction::ForwardedNpdu {
            return None;
        }
        let raw = self.data.get(..6)?;
        let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
        let port = u16::from_be_bytes([raw[4], raw[5]]);
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    /// Result code of a BVLC-Result message
    pub fn result_code(&self) -> Option<u16> {
        match (self.header.function, self.data.as_slice()) {
            (BvllFunction::Result, [high, low, ..]) => Some(u16::from_be_bytes([*high, *low])),
            _ => None,
        }
    }
}

/// Foreign device registration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignDevice {
    /// BBMD address
    pub bbmd: SocketAddr,
    /// Time-to-live in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u16,
}

fn default_ttl() -> u16 {
    constants::DEFAULT_FD_TTL
}

/// BACnet/IP transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacnetIpConfig {
    /// Local bind address
    pub bind_address: SocketAddr,
    /// Where broadcasts go. Empty means every local subnet.
    pub broadcast_addresses: Vec<SocketAddr>,
    /// Register with a BBMD and broadcast through it
    pub foreign_device: Option<ForeignDevice>,
    /// Receive buffer size
    pub buffer_size: usize,
}

impl Default for BacnetIpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                constants::BACNET_IP_PORT,
            )),
            broadcast_addresses: Vec::new(),
            foreign_device: None,
            buffer_size: constants::MAX_BVLL_LENGTH,
        }
    }
}

/// Timeout configuration for the operations the client performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Confirmed service requests
    pub request_timeout: Duration,
    /// How long Who-Is waits for I-Am replies
    pub discovery_timeout: Duration,
    /// Foreign device registration
    pub registration_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(3),
            registration_timeout: Duration::from_secs(10),
        }
    }
}

/// Bind a UDP socket for BACnet/IP.
///
/// Address reuse lets the tool share port 47808 with a local BACnet stack.
/// Must be called from within a tokio runtime.
pub fn bind_udp_socket(address: SocketAddr) -> Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    let socket = tokio::net::UdpSocket::from_std(socket.into())?;
    log::debug!("bound BACnet/IP socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// Broadcast address of the subnet `ip` lives on
pub fn calculate_broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Directed broadcast addresses of every non-loopback IPv4 interface.
/// Falls back to the limited broadcast address when none are found.
pub fn local_broadcast_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addresses: Vec<SocketAddr> = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|interface| !interface.is_loopback())
            .filter_map(|interface| match interface.addr {
                if_addrs::IfAddr::V4(v4) => Some(
                    v4.broadcast
                        .unwrap_or_else(|| calculate_broadcast_address(v4.ip, v4.netmask)),
                ),
                if_addrs::IfAddr::V6(_) => None,
            })
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
            .collect(),
        Err(e) => {
            log::warn!("could not list network interfaces: {}", e);
            Vec::new()
        }
    };
    addresses.sort();
    addresses.dedup();
    if addresses.is_empty() {
        addresses.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port));
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bvll_header_round_trip() {
        let header = BvllHeader::new(BvllFunction::OriginalBroadcastNpdu, 12);
        let encoded = header.encode();
        assert_eq!(encoded, [0x81, 0x0B, 0x00, 0x0C]);
        assert_eq!(BvllHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_bvll_header_rejects_garbage() {
        assert!(BvllHeader::decode(&[0x81, 0x0A]).is_err());
        assert!(BvllHeader::decode(&[0x82, 0x0A, 0x00, 0x04]).is_err());
        assert!(BvllHeader::decode(&[0x81, 0x20, 0x00, 0x04]).is_err());
        assert!(BvllHeader::decode(&[0x81, 0x0A, 0x00, 0x02]).is_err());
    }

    #[test]
    fn test_message_length_checked() {
        assert!(BvllMessage::decode(&[0x81, 0x0A, 0x00, 0x08, 0x01, 0x04]).is_err());
        // Trailing bytes past the declared length are ignored
        let message = BvllMessage::decode(&[0x81, 0x0A, 0x00, 0x06, 0x01, 0x04, 0xFF]).unwrap();
        assert_eq!(message.npdu(), Some(&[0x01, 0x04][..]));
    }

    #[test]
    fn test_forwarded_npdu() {
        let data = [
            0x81, 0x04, 0x00, 0x0C, 192, 168, 10, 20, 0xBA, 0xC0, 0x01, 0x00,
        ];
        let message = BvllMessage::decode(&data).unwrap();
        assert_eq!(message.npdu(), Some(&[0x01, 0x00][..]));
        assert_eq!(
            message.forwarded_from(),
            Some("192.168.10.20:47808".parse().unwrap())
        );
    }

    #[test]
    fn test_register_foreign_device() {
        let message = BvllMessage::register_foreign_device(900);
        assert_eq!(message.encode(), vec![0x81, 0x05, 0x00, 0x06, 0x03, 0x84]);
        assert_eq!(message.npdu(), None);

        let nak = BvllMessage::decode(&[0x81, 0x00, 0x00, 0x06, 0x00, 0x30]).unwrap();
        assert_eq!(nak.result_code(), Some(constants::BVLC_RESULT_REGISTER_FD_NAK));
    }

    #[test]
    fn test_calculate_broadcast_address() {
        let ip = Ipv4Addr::new(192, 168, 1, 100);
        assert_eq!(
            calculate_broadcast_address(ip, Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            calculate_broadcast_address(ip, Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(192, 168, 255, 255)
        );
    }

    #[test]
    fn test_local_broadcast_addresses_never_empty() {
        let addresses = local_broadcast_addresses(constants::BACNET_IP_PORT);
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(|a| a.port() == 47808));
    }

    #[tokio::test]
    async fn test_bind_udp_socket() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
    }
}
