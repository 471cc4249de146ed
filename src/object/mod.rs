//! BACnet Object Model
//!
//! Object types, property identifiers and object identifiers as they appear in
//! requests, plus [`PropertyValue`], the application-tagged value a plain
//! ReadProperty returns for ordinary (non-proprietary) properties.
//!
//! # Overview
//!
//! Both object types and property identifiers reserve a range for vendor
//! extensions. The settings this crate manages live entirely in that range
//! (object type 278 / property 1101 and object type 162 / property 1034), so
//! the enums keep proprietary values as first-class variants rather than
//! rejecting them.
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
//!
//! let device = ObjectIdentifier::new(ObjectType::Device, 1200);
//! assert_eq!(device.to_string(), "Device:1200");
//!
//! let settings: PropertyIdentifier = "1101".parse().unwrap();
//! assert!(settings.is_proprietary());
//! ```

use std::fmt;
use std::str::FromStr;

use crate::bacnet_enum;
use crate::encoding::{
    decode_character_string_octets, decode_object_id, decode_unsigned_octets, encode_object_id,
    ApplicationTag, EncodingError, Result, Tag, TagList,
};

bacnet_enum! {
    /// BACnet object types
    ObjectType: u16, proprietary 128..=1023 {
        AnalogInput = 0,
        AnalogOutput = 1,
        AnalogValue = 2,
        BinaryInput = 3,
        BinaryOutput = 4,
        BinaryValue = 5,
        Calendar = 6,
        Command = 7,
        Device = 8,
        EventEnrollment = 9,
        File = 10,
        Group = 11,
        Loop = 12,
        MultiStateInput = 13,
        MultiStateOutput = 14,
        NotificationClass = 15,
        Program = 16,
        Schedule = 17,
        Averaging = 18,
        MultiStateValue = 19,
        TrendLog = 20,
        NetworkPort = 56,
    }
}

bacnet_enum! {
    /// BACnet property identifiers
    PropertyIdentifier: u32, proprietary 512..=4_194_303 {
        ApplicationSoftwareVersion = 12,
        Description = 28,
        FirmwareRevision = 44,
        LocalDate = 56,
        LocalTime = 57,
        Location = 58,
        ModelName = 70,
        ObjectIdentifier = 75,
        ObjectList = 76,
        ObjectName = 77,
        ObjectType = 79,
        PresentValue = 85,
        ProtocolVersion = 98,
        SystemStatus = 112,
        VendorIdentifier = 120,
        VendorName = 121,
        ProtocolRevision = 139,
    }
}

/// Object type plus instance number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    /// Highest instance number representable on the wire
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Packed 32-bit wire form
    pub fn to_wire(&self) -> Result<u32> {
        encode_object_id(self.object_type.value(), self.instance)
    }

    /// Unpack the 32-bit wire form
    pub fn from_wire(value: u32) -> Self {
        let (object_type, instance) = decode_object_id(value);
        Self::new(ObjectType::from(object_type), instance)
    }

    /// Decode the four content octets of an object-identifier tag
    pub fn from_octets(data: &[u8]) -> Result<Self> {
        let raw: [u8; 4] = data.try_into().map_err(|_| EncodingError::InvalidLength)?;
        Ok(Self::from_wire(u32::from_be_bytes(raw)))
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Application-tagged value of an ordinary property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    Enumerated(u32),
    ObjectIdentifier(ObjectIdentifier),
    /// Anything else (constructed values, dates, bit strings, lists)
    Raw(TagList),
}

impl PropertyValue {
    /// Interpret a property value. A single application tag of a supported
    /// type becomes the matching variant; everything else stays raw.
    pub fn from_tags(tags: &TagList) -> Self {
        match tags.as_slice() {
            [Tag::Application { tag, data }] => {
                Self::from_application(*tag, data).unwrap_or_else(|_| PropertyValue::Raw(tags.clone()))
            }
            _ => PropertyValue::Raw(tags.clone()),
        }
    }

    fn from_application(tag: u8, data: &[u8]) -> Result<Self> {
        let value = match ApplicationTag::try_from(tag)? {
            ApplicationTag::Null => PropertyValue::Null,
            ApplicationTag::Boolean => PropertyValue::Boolean(data.first().copied() == Some(1)),
            ApplicationTag::UnsignedInt => PropertyValue::Unsigned(decode_unsigned_octets(data)?),
            ApplicationTag::SignedInt => PropertyValue::Signed(decode_signed_octets(data)?),
            ApplicationTag::Real => {
                let raw: [u8; 4] = data.try_into().map_err(|_| EncodingError::InvalidLength)?;
                PropertyValue::Real(f32::from_be_bytes(raw))
            }
            ApplicationTag::Double => {
                let raw: [u8; 8] = data.try_into().map_err(|_| EncodingError::InvalidLength)?;
                PropertyValue::Double(f64::from_be_bytes(raw))
            }
            ApplicationTag::OctetString => PropertyValue::OctetString(data.to_vec()),
            ApplicationTag::CharacterString => {
                PropertyValue::CharacterString(decode_character_string_octets(data)?)
            }
            ApplicationTag::Enumerated => PropertyValue::Enumerated(decode_unsigned_octets(data)?),
            ApplicationTag::ObjectIdentifier => {
                PropertyValue::ObjectIdentifier(ObjectIdentifier::from_octets(data)?)
            }
            ApplicationTag::BitString | ApplicationTag::Date | ApplicationTag::Time => {
                return Err(EncodingError::InvalidTag)
            }
        };
        Ok(value)
    }

    /// Text of a character-string value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::CharacterString(text) => Some(text),
            _ => None,
        }
    }
}

fn decode_signed_octets(data: &[u8]) -> Result<i32> {
    if data.is_empty() || data.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    let fill = if data[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut raw = [fill; 4];
    raw[4 - data.len()..].copy_from_slice(data);
    Ok(i32::from_be_bytes(raw))
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Boolean(value) => write!(f, "{}", value),
            PropertyValue::Unsigned(value) => write!(f, "{}", value),
            PropertyValue::Signed(value) => write!(f, "{}", value),
            PropertyValue::Real(value) => write!(f, "{}", value),
            PropertyValue::Double(value) => write!(f, "{}", value),
            PropertyValue::OctetString(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            PropertyValue::CharacterString(text) => write!(f, "{:?}", text),
            PropertyValue::Enumerated(value) => write!(f, "enumerated({})", value),
            PropertyValue::ObjectIdentifier(id) => write!(f, "{}", id),
            PropertyValue::Raw(tags) => write!(f, "<{} tags>", tags.len()),
        }
    }
}

/// Parse `"device"`, `"8"`, `"analog-input"` and friends
pub fn parse_object_type(s: &str) -> std::result::Result<ObjectType, ParseObjectTypeError> {
    ObjectType::from_str(s)
}
