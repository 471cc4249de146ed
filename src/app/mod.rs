//! BACnet Application Layer Module
//!
//! Forms and parses Application Protocol Data Units (APDUs). Only the client
//! side of unsegmented exchanges is needed here: confirmed and unconfirmed
//! requests go out; acknowledgements, errors, rejects and aborts come back.
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! Segmented ComplexACKs are recognised and reported so the caller can fail
//! cleanly; reassembly is not supported.
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::app::Apdu;
//! use bacnet_proxy_ip::service::UnconfirmedServiceChoice;
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: UnconfirmedServiceChoice::WhoIs,
//!     service_data: vec![],
//! };
//! assert_eq!(apdu.encode(), vec![0x10, 0x08]);
//! ```

use std::error::Error;
use std::fmt;

use crate::encoding::{decode_tag, decode_unsigned_octets, unsigned_octets, ApplicationTag};
use crate::service::{
    AbortReason, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason,
    UnconfirmedServiceChoice,
};

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// Invalid APDU format
    InvalidApdu(String),
    /// Unsupported APDU type
    UnsupportedApduType(u8),
    /// Unknown service choice
    UnknownService(u8),
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::InvalidApdu(msg) => write!(f, "Invalid APDU: {}", msg),
            ApplicationError::UnsupportedApduType(kind) => {
                write!(f, "Unsupported APDU type {}", kind)
            }
            ApplicationError::UnknownService(choice) => {
                write!(f, "Unknown service choice {}", choice)
            }
        }
    }
}

impl Error for ApplicationError {}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(ApplicationError::UnsupportedApduType(other)),
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request (never segmented by this client)
    ConfirmedRequest {
        segmented_response_accepted: bool,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        service_choice: ConfirmedServiceChoice,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: UnconfirmedServiceChoice,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: ErrorClass,
        error_code: ErrorCode,
    },

    /// Reject PDU
    Reject {
        invoke_id: u8,
        reject_reason: RejectReason,
    },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: AbortReason,
    },
}

impl Apdu {
    /// Invoke id of a confirmed exchange (None for unconfirmed requests)
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        match self {
            Apdu::ConfirmedRequest {
                segmented_response_accepted,
                max_response_size,
                invoke_id,
                service_choice,
                service_data,
            } => {
                let mut pdu_type = (ApduType::ConfirmedRequest as u8) << 4;
                if *segmented_response_accepted {
                    pdu_type |= 0x02;
                }
                buffer.push(pdu_type);
                // Max segments unspecified, max APDU size in the low nibble
                buffer.push(*max_response_size as u8);
                buffer.push(*invoke_id);
                buffer.push(*service_choice as u8);
                buffer.extend_from_slice(service_data);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice as u8);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }
            Apdu::ComplexAck {
                segmented,
                invoke_id,
                service_choice,
                service_data,
            } => {
                let mut pdu_type = (ApduType::ComplexAck as u8) << 4;
                if *segmented {
                    pdu_type |= 0x08;
                }
                buffer.push(pdu_type);
                buffer.push(*invoke_id);
                if *segmented {
                    // sequence number and window size
                    buffer.extend_from_slice(&[0, 1]);
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                encode_enumerated(&mut buffer, error_class.value());
                encode_enumerated(&mut buffer, error_code.value());
            }
            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(reject_reason.value());
            }
            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut pdu_type = (ApduType::Abort as u8) << 4;
                if *server {
                    pdu_type |= 0x01;
                }
                buffer.push(pdu_type);
                buffer.push(*invoke_id);
                buffer.push(abort_reason.value());
            }
        }

        buffer
    }

    /// Decode APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| ApplicationError::InvalidApdu("Empty APDU".to_string()))?;
        let pdu_type = ApduType::try_from(first >> 4)?;
        let octet = |index: usize| {
            data.get(index).copied().ok_or_else(|| {
                ApplicationError::InvalidApdu(format!("{:?} PDU truncated", pdu_type))
            })
        };

        match pdu_type {
            ApduType::ConfirmedRequest => {
                if first & 0x08 != 0 {
                    return Err(ApplicationError::InvalidApdu(
                        "Segmented requests are not supported".to_string(),
                    ));
                }
                let max_response_size = match octet(1)? & 0x0F {
                    0 => MaxApduSize::Up50,
                    1 => MaxApduSize::Up128,
                    2 => MaxApduSize::Up206,
                    3 => MaxApduSize::Up480,
                    4 => MaxApduSize::Up1024,
                    _ => MaxApduSize::Up1476,
                };
                let invoke_id = octet(2)?;
                let choice = octet(3)?;
                let service_choice = ConfirmedServiceChoice::try_from(choice)
                    .map_err(|_| ApplicationError::UnknownService(choice))?;
                Ok(Apdu::ConfirmedRequest {
                    segmented_response_accepted: first & 0x02 != 0,
                    max_response_size,
                    invoke_id,
                    service_choice,
                    service_data: data[4..].to_vec(),
                })
            }
            ApduType::UnconfirmedRequest => {
                let choice = octet(1)?;
                let service_choice = UnconfirmedServiceChoice::try_from(choice)
                    .map_err(|_| ApplicationError::UnknownService(choice))?;
                Ok(Apdu::UnconfirmedRequest {
                    service_choice,
                    service_data: data[2..].to_vec(),
                })
            }
            ApduType::SimpleAck => Ok(Apdu::SimpleAck {
                invoke_id: octet(1)?,
                service_choice: octet(2)?,
            }),
            ApduType::ComplexAck => {
                let segmented = first & 0x08 != 0;
                let invoke_id = octet(1)?;
                let choice_at = if segmented { 4 } else { 2 };
                let service_choice = octet(choice_at)?;
                Ok(Apdu::ComplexAck {
                    segmented,
                    invoke_id,
                    service_choice,
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }
            ApduType::Error => {
                let invoke_id = octet(1)?;
                let service_choice = octet(2)?;
                let mut pos = 3;
                let error_class = decode_enumerated(data, &mut pos)?;
                let error_code = decode_enumerated(data, &mut pos)?;
                Ok(Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class: ErrorClass::from(error_class),
                    error_code: ErrorCode::from(error_code),
                })
            }
            ApduType::Reject => Ok(Apdu::Reject {
                invoke_id: octet(1)?,
                reject_reason: RejectReason::from(octet(2)?),
            }),
            ApduType::Abort => Ok(Apdu::Abort {
                server: first & 0x01 != 0,
                invoke_id: octet(1)?,
                abort_reason: AbortReason::from(octet(2)?),
            }),
            ApduType::SegmentAck => Err(ApplicationError::UnsupportedApduType(first >> 4)),
        }
    }
}

// At most four content octets, so the length always fits the initial octet
fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let octets = unsigned_octets(value);
    buffer.push(((ApplicationTag::Enumerated as u8) << 4) | octets.len() as u8);
    buffer.extend_from_slice(&octets);
}

fn decode_enumerated(data: &[u8], pos: &mut usize) -> Result<u32> {
    let invalid = |what: &str| ApplicationError::InvalidApdu(format!("Error PDU: {}", what));
    let rest = data.get(*pos..).unwrap_or_default();
    let (header, consumed) = decode_tag(rest).map_err(|e| invalid(&e.to_string()))?;
    if header.context || header.number != ApplicationTag::Enumerated as u8 {
        return Err(invalid("expected enumerated value"));
    }
    let start = *pos + consumed;
    let end = start + header.lvt as usize;
    let octets = data.get(start..end).ok_or_else(|| invalid("value truncated"))?;
    *pos = end;
    decode_unsigned_octets(octets).map_err(|e| invalid(&e.to_string()))
}

/// Hands out invoke ids for confirmed requests
#[derive(Debug)]
pub struct InvokeIdGenerator {
    next: u8,
}

impl InvokeIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Next id; wraps around and skips 0
    pub fn next_id(&mut self) -> u8 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

impl Default for InvokeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_request_round_trip() {
        let apdu = Apdu::ConfirmedRequest {
            segmented_response_accepted: false,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 7,
            service_choice: ConfirmedServiceChoice::ReadProperty,
            service_data: vec![0x0C, 0x02, 0x00, 0x04, 0xB0, 0x19, 0x46],
        };
        let bytes = apdu.encode();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x07, 0x0C]);
        assert_eq!(Apdu::decode(&bytes).unwrap(), apdu);
    }

    #[test]
    fn test_decode_simple_ack() {
        let apdu = Apdu::decode(&[0x20, 0x11, 0x0F]).unwrap();
        assert_eq!(
            apdu,
            Apdu::SimpleAck {
                invoke_id: 0x11,
                service_choice: 15
            }
        );
        assert_eq!(apdu.invoke_id(), Some(0x11));
    }

    #[test]
    fn test_decode_complex_ack() {
        let apdu = Apdu::decode(&[0x30, 0x02, 0x0C, 0xAA, 0xBB]).unwrap();
        assert_eq!(
            apdu,
            Apdu::ComplexAck {
                segmented: false,
                invoke_id: 2,
                service_choice: 12,
                service_data: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn test_decode_segmented_complex_ack_is_flagged() {
        let apdu = Apdu::decode(&[0x3C, 0x02, 0x00, 0x04, 0x0C, 0xAA]).unwrap();
        assert!(matches!(apdu, Apdu::ComplexAck { segmented: true, service_choice: 12, .. }));
    }

    #[test]
    fn test_decode_error_pdu() {
        // property / unknown-property
        let apdu = Apdu::decode(&[0x50, 0x03, 0x0C, 0x91, 0x02, 0x91, 0x20]).unwrap();
        assert_eq!(
            apdu,
            Apdu::Error {
                invoke_id: 3,
                service_choice: 12,
                error_class: ErrorClass::Property,
                error_code: ErrorCode::UnknownProperty,
            }
        );
        assert_eq!(Apdu::decode(&apdu.encode()).unwrap(), apdu);
    }

    #[test]
    fn test_encode_error_pdu_wide_values() {
        let apdu = Apdu::Error {
            invoke_id: 9,
            service_choice: 15,
            error_class: ErrorClass::Proprietary(64),
            error_code: ErrorCode::Proprietary(65535),
        };
        assert_eq!(
            apdu.encode(),
            vec![0x50, 0x09, 0x0F, 0x91, 0x40, 0x92, 0xFF, 0xFF]
        );
        assert_eq!(Apdu::decode(&apdu.encode()).unwrap(), apdu);
    }

    #[test]
    fn test_decode_reject_and_abort() {
        assert_eq!(
            Apdu::decode(&[0x60, 0x04, 0x09]).unwrap(),
            Apdu::Reject {
                invoke_id: 4,
                reject_reason: RejectReason::UnrecognizedService
            }
        );
        assert_eq!(
            Apdu::decode(&[0x71, 0x05, 0x04]).unwrap(),
            Apdu::Abort {
                server: true,
                invoke_id: 5,
                abort_reason: AbortReason::SegmentationNotSupported
            }
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x20, 0x01]).is_err());
        assert!(Apdu::decode(&[0x50, 0x03, 0x0C, 0x91]).is_err());
    }

    #[test]
    fn test_invoke_ids_skip_zero() {
        let mut ids = InvokeIdGenerator::new();
        let seen: Vec<u8> = (0..300).map(|_| ids.next_id()).collect();
        assert!(!seen.contains(&0));
        assert_eq!(seen[0], 1);
        assert_eq!(seen[254], 255);
        assert_eq!(seen[255], 1);
    }
}
