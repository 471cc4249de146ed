//! BACnet Encoding/Decoding Module
//!
//! This module provides the primitive tag-level encoding used by every other
//! layer of the crate: tag headers, unsigned and enumerated values, object
//! identifiers and character strings, in both application and context form.
//!
//! # Overview
//!
//! A BACnet tag header packs three things into its first octet:
//! - the tag number in the high nibble (0xF means an extension octet follows)
//! - the class bit (0x08), set for context-specific tags
//! - the length/value/type field in the low three bits
//!
//! Length/value/type 6 and 7 on a context tag mark opening and closing tags.
//! A value of 5 means the length follows in one, three or five octets.
//!
//! The [`tags`] submodule builds on these primitives to parse whole tag
//! streams with nesting checks.
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::encoding::*;
//!
//! let mut buffer = Vec::new();
//! encode_context_unsigned(&mut buffer, 1, 1101).unwrap();
//! assert_eq!(buffer, vec![0x1A, 0x04, 0x4D]);
//! ```

pub mod tags;

use std::error::Error;
use std::fmt;

pub use tags::{parse, serialize, Tag, TagClass, TagCursor, TagList};

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid tag encountered
    InvalidTag,
    /// Invalid length value
    InvalidLength,
    /// Unexpected end of data during decoding
    UnexpectedEndOfData,
    /// Invalid encoding format
    InvalidFormat(String),
    /// Value out of valid range
    ValueOutOfRange,
    /// Opening and closing tags do not nest
    MalformedTag(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::InvalidTag => write!(f, "Invalid tag encountered"),
            EncodingError::InvalidLength => write!(f, "Invalid length value"),
            EncodingError::UnexpectedEndOfData => write!(f, "Unexpected end of data"),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            EncodingError::ValueOutOfRange => write!(f, "Value out of valid range"),
            EncodingError::MalformedTag(msg) => write!(f, "Malformed tag stream: {}", msg),
        }
    }
}

impl Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag),
        }
    }
}

/// Character sets defined for BACnet character strings
pub mod charset {
    pub const UTF8: u8 = 0;
    pub const UCS2: u8 = 4;
    pub const ISO_8859_1: u8 = 5;
}

/// Decoded form of a tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    /// Tag number (application type or context number)
    pub number: u8,
    /// Whether the class bit is set
    pub context: bool,
    /// Low three bits of the first octet, before any extended length
    pub lvt_bits: u8,
    /// Length/value/type: content length, boolean value or 6/7 for opening/closing
    pub lvt: u32,
}

impl TagHeader {
    /// Opening tag marker
    pub fn is_opening(&self) -> bool {
        self.context && self.lvt_bits == 6
    }

    /// Closing tag marker
    pub fn is_closing(&self) -> bool {
        self.context && self.lvt_bits == 7
    }
}

/// Write the tag number and class octet(s), leaving `lvt_bits` in the low three bits.
fn encode_tag_number(buffer: &mut Vec<u8>, tag_number: u8, context: bool, lvt_bits: u8) -> Result<()> {
    if tag_number == 0xFF {
        return Err(EncodingError::ValueOutOfRange);
    }

    let class = if context { 0x08 } else { 0x00 };
    if tag_number < 15 {
        buffer.push((tag_number << 4) | class | lvt_bits);
    } else {
        buffer.push(0xF0 | class | lvt_bits);
        buffer.push(tag_number);
    }
    Ok(())
}

/// Encode a tag header carrying `length` content octets
pub fn encode_tag(buffer: &mut Vec<u8>, tag_number: u8, context: bool, length: usize) -> Result<()> {
    if length < 5 {
        return encode_tag_number(buffer, tag_number, context, length as u8);
    }

    encode_tag_number(buffer, tag_number, context, 5)?;
    if length < 254 {
        buffer.push(length as u8);
    } else if length <= u16::MAX as usize {
        buffer.push(254);
        buffer.extend_from_slice(&(length as u16).to_be_bytes());
    } else if length <= u32::MAX as usize {
        buffer.push(255);
        buffer.extend_from_slice(&(length as u32).to_be_bytes());
    } else {
        return Err(EncodingError::InvalidLength);
    }
    Ok(())
}

/// Encode a BACnet application tag
pub fn encode_application_tag(buffer: &mut Vec<u8>, tag: ApplicationTag, length: usize) -> Result<()> {
    encode_tag(buffer, tag as u8, false, length)
}

/// Encode a context-specific tag
pub fn encode_context_tag(buffer: &mut Vec<u8>, tag_number: u8, length: usize) -> Result<()> {
    encode_tag(buffer, tag_number, true, length)
}

/// Encode opening tag for constructed data
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    encode_tag_number(buffer, tag_number, true, 6)
}

/// Encode closing tag for constructed data
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    encode_tag_number(buffer, tag_number, true, 7)
}

/// Decode a tag header, returning the header and the number of octets consumed
pub fn decode_tag(data: &[u8]) -> Result<(TagHeader, usize)> {
    let first = *data.first().ok_or(EncodingError::UnexpectedEndOfData)?;
    let context = first & 0x08 != 0;
    let lvt_bits = first & 0x07;
    let mut consumed = 1;

    let mut number = first >> 4;
    if number == 0x0F {
        number = *data.get(1).ok_or(EncodingError::UnexpectedEndOfData)?;
        if number == 0xFF {
            return Err(EncodingError::InvalidTag);
        }
        consumed += 1;
    }

    let lvt = if lvt_bits == 5 {
        let len_byte = *data.get(consumed).ok_or(EncodingError::UnexpectedEndOfData)?;
        consumed += 1;
        match len_byte {
            254 => {
                let raw = data
                    .get(consumed..consumed + 2)
                    .ok_or(EncodingError::UnexpectedEndOfData)?;
                consumed += 2;
                u16::from_be_bytes([raw[0], raw[1]]) as u32
            }
            255 => {
                let raw = data
                    .get(consumed..consumed + 4)
                    .ok_or(EncodingError::UnexpectedEndOfData)?;
                consumed += 4;
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
            }
            n => n as u32,
        }
    } else {
        lvt_bits as u32
    };

    Ok((
        TagHeader {
            number,
            context,
            lvt_bits,
            lvt,
        },
        consumed,
    ))
}

/// Minimal big-endian octets for an unsigned value (at least one octet)
pub fn unsigned_octets(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Interpret up to four big-endian octets as an unsigned value
pub fn decode_unsigned_octets(data: &[u8]) -> Result<u32> {
    if data.is_empty() || data.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    Ok(data.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Encode a BACnet unsigned integer with its application tag
pub fn encode_application_unsigned(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let octets = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::UnsignedInt, octets.len())?;
    buffer.extend_from_slice(&octets);
    Ok(())
}

/// Encode a BACnet enumerated value with its application tag
pub fn encode_application_enumerated(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let octets = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::Enumerated, octets.len())?;
    buffer.extend_from_slice(&octets);
    Ok(())
}

/// Encode an unsigned value under a context tag
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    let octets = unsigned_octets(value);
    encode_context_tag(buffer, tag_number, octets.len())?;
    buffer.extend_from_slice(&octets);
    Ok(())
}

/// Encode an enumerated value under a context tag
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    encode_context_unsigned(buffer, tag_number, value)
}

/// Encode a packed object identifier under a context tag
pub fn encode_context_object_id(buffer: &mut Vec<u8>, tag_number: u8, object_id: u32) -> Result<()> {
    encode_context_tag(buffer, tag_number, 4)?;
    buffer.extend_from_slice(&object_id.to_be_bytes());
    Ok(())
}

/// Encode a packed object identifier with its application tag
pub fn encode_application_object_id(buffer: &mut Vec<u8>, object_id: u32) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4)?;
    buffer.extend_from_slice(&object_id.to_be_bytes());
    Ok(())
}

/// Encode a UTF-8 character string under a context tag
pub fn encode_context_character_string(buffer: &mut Vec<u8>, tag_number: u8, value: &str) -> Result<()> {
    encode_context_tag(buffer, tag_number, value.len() + 1)?;
    buffer.push(charset::UTF8);
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Decode the content octets of a character string (charset octet first)
pub fn decode_character_string_octets(data: &[u8]) -> Result<String> {
    let (&set, text) = data.split_first().ok_or(EncodingError::InvalidLength)?;
    let encoding = match set {
        charset::UTF8 => encoding_rs::UTF_8,
        charset::UCS2 => encoding_rs::UTF_16BE,
        charset::ISO_8859_1 => encoding_rs::WINDOWS_1252,
        other => {
            return Err(EncodingError::InvalidFormat(format!(
                "unsupported character set {}",
                other
            )))
        }
    };
    let (decoded, _, had_errors) = encoding.decode(text);
    if had_errors {
        log::debug!("character string contained invalid sequences for charset {}", set);
    }
    Ok(decoded.into_owned())
}

/// Pack an object type and instance into the 32-bit wire form
pub fn encode_object_id(object_type: u16, instance: u32) -> Result<u32> {
    if object_type > 0x3FF || instance > 0x3F_FFFF {
        return Err(EncodingError::ValueOutOfRange);
    }
    Ok(((object_type as u32) << 22) | instance)
}

/// Split the 32-bit wire form into object type and instance
pub fn decode_object_id(value: u32) -> (u16, u32) {
    ((value >> 22) as u16, value & 0x3F_FFFF)
}
