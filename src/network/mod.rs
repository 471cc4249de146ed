//! BACnet Network Layer Module
//!
//! The network layer header (NPDU) sits between the BACnet/IP virtual link
//! header and the APDU. This client never routes, so only the parts needed to
//! address a device and to skip over routing information in replies are
//! implemented.
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU contains:
//! - Protocol version
//! - Control information (priority, data expecting reply, etc.)
//! - Destination network address (DNET, DADR)
//! - Source network address (SNET, SADR)
//! - Hop count for routing
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::network::Npdu;
//!
//! let npdu = Npdu::confirmed();
//! assert_eq!(npdu.encode(), vec![0x01, 0x04]);
//! ```

use std::error::Error;
use std::fmt;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in network operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid NPDU format
    InvalidNpdu(String),
    /// Network layer message where an APDU was expected
    NetworkMessage(u8),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidNpdu(msg) => write!(f, "Invalid NPDU: {}", msg),
            NetworkError::NetworkMessage(kind) => {
                write!(f, "Network layer message 0x{:02X} carries no APDU", kind)
            }
        }
    }
}

impl Error for NetworkError {}

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl NpduControl {
    /// Create control byte from flags
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte | (self.priority & 0x03)
    }

    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// Network address (network number + MAC address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Network number (0xFFFF = global broadcast)
    pub network: u16,
    /// MAC address on that network (empty = broadcast on that network)
    pub address: Vec<u8>,
}

/// Network Protocol Data Unit (NPDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    /// Control information
    pub control: NpduControl,
    /// Destination network address
    pub destination: Option<NetworkAddress>,
    /// Source network address
    pub source: Option<NetworkAddress>,
    /// Hop count (only present if destination is present)
    pub hop_count: Option<u8>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}

impl Npdu {
    /// Local, no reply expected
    pub fn new() -> Self {
        Self {
            version: 1,
            control: NpduControl::default(),
            destination: None,
            source: None,
            hop_count: None,
        }
    }

    /// Local, expecting a reply (confirmed requests)
    pub fn confirmed() -> Self {
        let mut npdu = Self::new();
        npdu.control.expecting_reply = true;
        npdu
    }

    /// Global broadcast to every network
    pub fn global_broadcast() -> Self {
        Self {
            version: 1,
            control: NpduControl {
                destination_present: true,
                ..NpduControl::default()
            },
            destination: Some(NetworkAddress {
                network: 0xFFFF,
                address: Vec::new(),
            }),
            source: None,
            hop_count: Some(255),
        }
    }

    /// Encode NPDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(8);
        buffer.push(self.version);

        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();
        buffer.push(control.to_byte());

        for address in [&self.destination, &self.source].into_iter().flatten() {
            buffer.extend_from_slice(&address.network.to_be_bytes());
            buffer.push(address.address.len() as u8);
            buffer.extend_from_slice(&address.address);
        }

        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(255));
        }

        buffer
    }

    /// Decode NPDU from bytes, returning it with the number of octets consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".to_string()));
        }

        let version = data[0];
        if version != 1 {
            return Err(NetworkError::InvalidNpdu(format!(
                "Invalid NPDU version: {}",
                version
            )));
        }

        let control = NpduControl::from_byte(data[1]);
        let mut pos = 2;

        let destination = if control.destination_present {
            Some(decode_address(data, &mut pos, "destination")?)
        } else {
            None
        };

        let source = if control.source_present {
            Some(decode_address(data, &mut pos, "source")?)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            let hops = *data
                .get(pos)
                .ok_or_else(|| NetworkError::InvalidNpdu("Missing hop count".to_string()))?;
            pos += 1;
            Some(hops)
        } else {
            None
        };

        if control.network_message {
            let kind = data.get(pos).copied().unwrap_or(0);
            return Err(NetworkError::NetworkMessage(kind));
        }

        Ok((
            Self {
                version,
                control,
                destination,
                source,
                hop_count,
            },
            pos,
        ))
    }
}

fn decode_address(data: &[u8], pos: &mut usize, which: &str) -> Result<NetworkAddress> {
    let header = data
        .get(*pos..*pos + 3)
        .ok_or_else(|| NetworkError::InvalidNpdu(format!("Invalid {} address", which)))?;
    let network = u16::from_be_bytes([header[0], header[1]]);
    let length = header[2] as usize;
    *pos += 3;

    let address = data
        .get(*pos..*pos + length)
        .ok_or_else(|| NetworkError::InvalidNpdu(format!("Invalid {} address length", which)))?
        .to_vec();
    *pos += length;

    Ok(NetworkAddress { network, address })
}
