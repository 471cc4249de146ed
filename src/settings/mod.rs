//! Proprietary network settings codec
//!
//! Two controller families keep their BACnet/IP network settings (IP type,
//! UDP port, BBMD/foreign address, TTL, proxy address, network number) in a
//! single proprietary constructed property:
//!
//! - [`SettingsModel::ModelA`]: BCP object 162, property 1034 (eTCH, DCU)
//! - [`SettingsModel::ModelB`]: NET object 278, property 1101 (DSC, DSM-RTR, eBMGR)
//!
//! Each layout is a static table of slots. Decoding walks the table and
//! the tag stream in lockstep, checking every tag, and keeps the raw content
//! of every value slot. Encoding walks the same table, emitting the kept bytes
//! unless a [`SettingsPatch`] replaces that field. Everything the patch does
//! not name is reproduced byte for byte.
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use bacnet_proxy_ip::settings::{SettingsModel, SettingsPatch, SettingsRecord};
//!
//! let record = SettingsRecord::template(SettingsModel::ModelA);
//! assert_eq!(record.proxy_address(), Some(Ipv4Addr::new(72, 12, 96, 12)));
//!
//! let patch = SettingsPatch::new().proxy_address(Ipv4Addr::new(203, 0, 113, 5));
//! let tags = record.encode(&patch).unwrap();
//! let patched = SettingsRecord::decode(SettingsModel::ModelA, &tags).unwrap();
//! assert_eq!(patched.proxy_address(), Some(Ipv4Addr::new(203, 0, 113, 5)));
//! assert_eq!(patched.opaque_blocks(), record.opaque_blocks());
//! ```

pub mod selection;

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use bytes::Bytes;
use thiserror::Error;

use crate::encoding::{self, charset, unsigned_octets, EncodingError, Tag, TagList};
use crate::util::parse_ipv4;

pub use selection::{firmware_release, infer_model, select, SettingsLocation};

/// Errors raised while decoding, encoding or locating settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// The bytes are not a well-formed tag stream
    #[error("malformed tag stream: {0}")]
    MalformedTag(EncodingError),
    /// The tag stream does not follow the model's layout
    #[error("{model} layout mismatch at slot {slot}: expected {expected}, found {found}")]
    SchemaMismatch {
        model: SettingsModel,
        slot: usize,
        expected: String,
        found: String,
    },
    /// No layout is known for this model name and firmware
    #[error("no settings layout for model {model:?} firmware {version:?}")]
    UnknownModel { model: String, version: String },
    /// A patch value cannot be stored in the field
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: Field, reason: String },
}

impl From<EncodingError> for SettingsError {
    fn from(error: EncodingError) -> Self {
        SettingsError::MalformedTag(error)
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// The two settings layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsModel {
    /// BCP object 162 / property 1034
    ModelA,
    /// NET object 278 / property 1101
    ModelB,
}

impl SettingsModel {
    pub(crate) fn schema(self) -> &'static [Slot] {
        match self {
            SettingsModel::ModelA => MODEL_A,
            SettingsModel::ModelB => MODEL_B,
        }
    }

    fn template_values(self) -> &'static [&'static [u8]] {
        match self {
            SettingsModel::ModelA => MODEL_A_TEMPLATE,
            SettingsModel::ModelB => MODEL_B_TEMPLATE,
        }
    }
}

impl fmt::Display for SettingsModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsModel::ModelA => f.write_str("Model-A (BCP)"),
            SettingsModel::ModelB => f.write_str("Model-B (NET)"),
        }
    }
}

/// What a value slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    NetNumber,
    IpType,
    Port,
    ForeignAddress,
    ForeignTtl,
    ProxyAddress,
    /// Bytes kept verbatim, grouped under a name
    Opaque(&'static str),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::NetNumber => f.write_str("net number"),
            Field::IpType => f.write_str("IP type"),
            Field::Port => f.write_str("port"),
            Field::ForeignAddress => f.write_str("foreign address"),
            Field::ForeignTtl => f.write_str("foreign TTL"),
            Field::ProxyAddress => f.write_str("proxy address"),
            Field::Opaque(name) => write!(f, "opaque block {}", name),
        }
    }
}

/// Content shapes a value slot accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    /// 1 or 2 octets, big-endian
    Unsigned,
    /// Exactly one octet
    Octet,
    /// 4 raw octets, or a single octet when unset
    RawAddress,
    /// Character string: charset octet 0x00 then dotted text
    TextAddress,
    /// Anything
    Any,
}

impl Width {
    fn accepts(self, data: &[u8]) -> bool {
        match self {
            Width::Unsigned => (1..=2).contains(&data.len()),
            Width::Octet => data.len() == 1,
            Width::RawAddress => data.len() == 1 || data.len() == 4,
            Width::TextAddress => data.first() == Some(&charset::UTF8),
            Width::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Width::Unsigned => "1-2 octets",
            Width::Octet => "1 octet",
            Width::RawAddress => "1 or 4 octets",
            Width::TextAddress => "UTF-8 character string",
            Width::Any => "any length",
        }
    }
}

/// One position in a settings layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Open(u8),
    Close(u8),
    Value { context: u8, field: Field, width: Width },
}

const fn value(context: u8, field: Field, width: Width) -> Slot {
    Slot::Value { context, field, width }
}

const fn opaque(context: u8, name: &'static str) -> Slot {
    Slot::Value {
        context,
        field: Field::Opaque(name),
        width: Width::Any,
    }
}

static MODEL_A: &[Slot] = &[
    Slot::Open(0),
    opaque(0, "header"),
    opaque(1, "header"),
    Slot::Close(0),
    opaque(1, "context-1-2"),
    opaque(2, "context-1-2"),
    value(3, Field::NetNumber, Width::Unsigned),
    opaque(4, "context-4"),
    Slot::Open(5),
    opaque(0, "block-5"),
    opaque(1, "block-5"),
    Slot::Close(5),
    opaque(6, "context-6-7"),
    opaque(7, "context-6-7"),
    Slot::Open(8),
    opaque(0, "block-8"),
    opaque(1, "block-8"),
    opaque(2, "block-8"),
    opaque(3, "block-8"),
    opaque(4, "block-8"),
    opaque(5, "block-8"),
    opaque(6, "block-8"),
    opaque(7, "block-8"),
    opaque(8, "block-8"),
    Slot::Close(8),
    Slot::Open(9),
    value(0, Field::IpType, Width::Octet),
    value(1, Field::Port, Width::Unsigned),
    value(2, Field::ForeignAddress, Width::RawAddress),
    value(3, Field::ForeignTtl, Width::Unsigned),
    value(4, Field::ProxyAddress, Width::RawAddress),
    opaque(5, "block-9-tail"),
    opaque(6, "block-9-tail"),
    Slot::Close(9),
    opaque(10, "context-10-13"),
    opaque(11, "context-10-13"),
    opaque(12, "context-10-13"),
    opaque(13, "context-10-13"),
];

static MODEL_A_TEMPLATE: &[&[u8]] = &[
    &[0x19],
    &[0x01],
    &[0x01],
    &[0x00],
    &[0x9C, 0x40],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0xFF, 0xFF, 0xFF, 0xFF],
    &[0x02],
    &[0xBA, 0xC0],
    &[0x00],
    &[0x3C],
    &[0x48, 0x0C, 0x60, 0x0C],
    &[0x00],
    &[0xFF, 0xFF, 0xFF, 0xFF],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00, 0x00, 0x00, 0x00],
];

static MODEL_B: &[Slot] = &[
    Slot::Open(1),
    value(0, Field::NetNumber, Width::Unsigned),
    opaque(1, "context-1"),
    value(2, Field::IpType, Width::Octet),
    value(3, Field::ForeignAddress, Width::TextAddress),
    value(4, Field::ForeignTtl, Width::Unsigned),
    value(5, Field::ProxyAddress, Width::TextAddress),
    opaque(6, "context-6-8"),
    opaque(7, "context-6-8"),
    opaque(8, "context-6-8"),
    value(9, Field::Port, Width::Unsigned),
    opaque(10, "context-10-12"),
    opaque(11, "context-10-12"),
    opaque(12, "context-10-12"),
    opaque(13, "context-13"),
    opaque(14, "context-14-17"),
    opaque(15, "context-14-17"),
    opaque(16, "context-14-17"),
    opaque(17, "context-14-17"),
    Slot::Close(1),
];

const UNSET_TEXT_ADDRESS: &[u8] = b"\x00000.000.000.000";

static MODEL_B_TEMPLATE: &[&[u8]] = &[
    &[0x9C, 0xA4],
    &[0x02],
    &[0x02],
    UNSET_TEXT_ADDRESS,
    &[0x3C],
    UNSET_TEXT_ADDRESS,
    &[0x00],
    &[0x00],
    &[0x00],
    &[0xBA, 0xC0],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0xFF, 0xFF, 0xFF, 0xFF],
    &[0x00],
    &[0x00],
    &[0x00],
    &[0x00],
];

fn describe_tag(tag: Option<&Tag>) -> String {
    match tag {
        None => "end of stream".to_string(),
        Some(Tag::Opening { context }) => format!("opening tag {}", context),
        Some(Tag::Closing { context }) => format!("closing tag {}", context),
        Some(Tag::Context { context, data }) => {
            format!("context tag {} with {} octets", context, data.len())
        }
        Some(Tag::Application { tag, .. }) => format!("application tag {}", tag),
    }
}

/// Decoded settings: the raw content of every value slot, in layout order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    model: SettingsModel,
    values: Vec<Bytes>,
}

impl SettingsRecord {
    /// Factory defaults for a model
    pub fn template(model: SettingsModel) -> Self {
        Self {
            model,
            values: model
                .template_values()
                .iter()
                .map(|value| Bytes::from_static(value))
                .collect(),
        }
    }

    /// Decode a settings property value
    pub fn decode(model: SettingsModel, tags: &TagList) -> Result<Self> {
        let mut cursor = tags.cursor();
        let mut values = Vec::new();

        for (slot, expected) in model.schema().iter().enumerate() {
            let found = cursor.pop();
            let mismatch = |what: String| SettingsError::SchemaMismatch {
                model,
                slot,
                expected: what,
                found: describe_tag(found),
            };
            match (*expected, found) {
                (Slot::Open(c), Some(Tag::Opening { context })) if c == *context => {}
                (Slot::Close(c), Some(Tag::Closing { context })) if c == *context => {}
                (Slot::Value { context: c, width, .. }, Some(Tag::Context { context, data }))
                    if c == *context =>
                {
                    if !width.accepts(data) {
                        return Err(mismatch(format!("context tag {} with {}", c, width.describe())));
                    }
                    values.push(data.clone());
                }
                (Slot::Open(c), _) => return Err(mismatch(format!("opening tag {}", c))),
                (Slot::Close(c), _) => return Err(mismatch(format!("closing tag {}", c))),
                (Slot::Value { context: c, .. }, _) => {
                    return Err(mismatch(format!("context tag {}", c)))
                }
            }
        }

        if !cursor.is_empty() {
            return Err(SettingsError::SchemaMismatch {
                model,
                slot: model.schema().len(),
                expected: "end of stream".to_string(),
                found: describe_tag(cursor.peek()),
            });
        }

        log::trace!("decoded {} settings ({} values)", model, values.len());
        Ok(Self { model, values })
    }

    /// Parse raw property bytes, then decode
    pub fn decode_bytes(model: SettingsModel, data: &[u8]) -> Result<Self> {
        let tags = encoding::parse(data)?;
        Self::decode(model, &tags)
    }

    /// Encode back into a tag stream, replacing only the patched fields
    pub fn encode(&self, patch: &SettingsPatch) -> Result<TagList> {
        let mut values = self.values.iter();
        let mut tags = TagList::new();

        for slot in self.model.schema() {
            let tag = match *slot {
                Slot::Open(context) => Tag::Opening { context },
                Slot::Close(context) => Tag::Closing { context },
                Slot::Value { context, field, width } => {
                    let original = values.next().ok_or_else(|| SettingsError::InvalidValue {
                        field,
                        reason: "record is shorter than its layout".to_string(),
                    })?;
                    let data = match patch.get(field) {
                        Some(new_value) => patched_bytes(field, width, original, new_value)?,
                        None => original.clone(),
                    };
                    Tag::Context { context, data }
                }
            };
            tags.push(tag);
        }

        Ok(tags)
    }

    /// Encode straight to property bytes
    pub fn encode_bytes(&self, patch: &SettingsPatch) -> Result<Vec<u8>> {
        Ok(encoding::serialize(&self.encode(patch)?)?)
    }

    pub fn model(&self) -> SettingsModel {
        self.model
    }

    fn raw(&self, wanted: Field) -> &[u8] {
        self.model
            .schema()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Value { field, .. } => Some(*field),
                _ => None,
            })
            .zip(&self.values)
            .find(|(field, _)| *field == wanted)
            .map(|(_, data)| data.as_ref())
            .unwrap_or_default()
    }

    fn unsigned(&self, field: Field) -> u16 {
        self.raw(field)
            .iter()
            .fold(0u16, |acc, octet| (acc << 8) | *octet as u16)
    }

    pub fn net_number(&self) -> u16 {
        self.unsigned(Field::NetNumber)
    }

    pub fn ip_type(&self) -> u8 {
        self.raw(Field::IpType).first().copied().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.unsigned(Field::Port)
    }

    pub fn foreign_ttl(&self) -> u16 {
        self.unsigned(Field::ForeignTtl)
    }

    /// Address text as stored (dotted quad for Model-A, the raw string for Model-B)
    pub fn address_text(&self, field: Field) -> String {
        let data = self.raw(field);
        match self.model {
            SettingsModel::ModelA => match <[u8; 4]>::try_from(data) {
                Ok(octets) => Ipv4Addr::from(octets).to_string(),
                Err(_) => Ipv4Addr::UNSPECIFIED.to_string(),
            },
            SettingsModel::ModelB => {
                String::from_utf8_lossy(data.get(1..).unwrap_or_default()).into_owned()
            }
        }
    }

    /// BBMD address; None when unset
    pub fn foreign_address(&self) -> Option<Ipv4Addr> {
        match self.model {
            SettingsModel::ModelA => <[u8; 4]>::try_from(self.raw(Field::ForeignAddress))
                .ok()
                .map(Ipv4Addr::from),
            SettingsModel::ModelB => parse_ipv4(&self.address_text(Field::ForeignAddress))
                .filter(|address| !address.is_unspecified()),
        }
    }

    /// Proxy address. An unset Model-A address reads as 0.0.0.0; None means
    /// the stored text is not an IPv4 address.
    pub fn proxy_address(&self) -> Option<Ipv4Addr> {
        parse_ipv4(&self.address_text(Field::ProxyAddress))
    }

    /// Opaque groups in layout order, each with its slots' raw content
    pub fn opaque_blocks(&self) -> Vec<(&'static str, Vec<Bytes>)> {
        let mut blocks: Vec<(&'static str, Vec<Bytes>)> = Vec::new();
        let fields = self.model.schema().iter().filter_map(|slot| match slot {
            Slot::Value { field, .. } => Some(*field),
            _ => None,
        });
        for (field, data) in fields.zip(&self.values) {
            let Field::Opaque(name) = field else {
                continue;
            };
            match blocks.last_mut() {
                Some((last, group)) if *last == name => group.push(data.clone()),
                _ => blocks.push((name, vec![data.clone()])),
            }
        }
        blocks
    }
}

impl fmt::Display for SettingsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.model)?;
        writeln!(f, "  net number:      {}", self.net_number())?;
        writeln!(f, "  IP type:         {}", self.ip_type())?;
        writeln!(f, "  port:            {}", self.port())?;
        writeln!(f, "  foreign address: {}", self.address_text(Field::ForeignAddress))?;
        writeln!(f, "  foreign TTL:     {}", self.foreign_ttl())?;
        write!(f, "  proxy address:   {}", self.address_text(Field::ProxyAddress))
    }
}

/// A new value for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchValue {
    Unsigned(u32),
    Address(Ipv4Addr),
}

/// Fields to replace when encoding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    values: BTreeMap<Field, PatchValue>,
}

impl SettingsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proxy_address(mut self, address: Ipv4Addr) -> Self {
        self.values.insert(Field::ProxyAddress, PatchValue::Address(address));
        self
    }

    pub fn foreign_address(mut self, address: Ipv4Addr) -> Self {
        self.values.insert(Field::ForeignAddress, PatchValue::Address(address));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.values.insert(Field::Port, PatchValue::Unsigned(port as u32));
        self
    }

    pub fn foreign_ttl(mut self, ttl: u16) -> Self {
        self.values.insert(Field::ForeignTtl, PatchValue::Unsigned(ttl as u32));
        self
    }

    pub fn net_number(mut self, net_number: u16) -> Self {
        self.values.insert(Field::NetNumber, PatchValue::Unsigned(net_number as u32));
        self
    }

    pub fn ip_type(mut self, ip_type: u8) -> Self {
        self.values.insert(Field::IpType, PatchValue::Unsigned(ip_type as u32));
        self
    }

    pub fn get(&self, field: Field) -> Option<PatchValue> {
        self.values.get(&field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Content for a patched slot
fn patched_bytes(field: Field, width: Width, original: &[u8], value: PatchValue) -> Result<Bytes> {
    let invalid = |reason: &str| SettingsError::InvalidValue {
        field,
        reason: reason.to_string(),
    };
    let data = match (width, value) {
        (Width::Unsigned | Width::Octet, PatchValue::Unsigned(number)) => {
            let minimal = unsigned_octets(number);
            let limit = if width == Width::Octet { 1 } else { 2 };
            if minimal.len() > limit {
                return Err(invalid("value does not fit"));
            }
            if minimal.len() >= original.len() {
                minimal
            } else {
                let mut padded = vec![0u8; original.len() - minimal.len()];
                padded.extend_from_slice(&minimal);
                padded
            }
        }
        (Width::RawAddress, PatchValue::Address(address)) => address.octets().to_vec(),
        (Width::TextAddress, PatchValue::Address(address)) => {
            let mut text = vec![charset::UTF8];
            text.extend_from_slice(address.to_string().as_bytes());
            text
        }
        (Width::Any, _) => return Err(invalid("opaque blocks cannot be patched")),
        _ => return Err(invalid("wrong kind of value")),
    };
    Ok(Bytes::from(data))
}

/// Index of the tag holding `field` in an encoded stream
#[cfg(test)]
pub(crate) fn tag_index(model: SettingsModel, wanted: Field) -> Option<usize> {
    model
        .schema()
        .iter()
        .position(|slot| matches!(slot, Slot::Value { field, .. } if *field == wanted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MODELS: [SettingsModel; 2] = [SettingsModel::ModelA, SettingsModel::ModelB];

    /// Model-B fixture as captured from a DSC controller
    const MODEL_B_CAPTURE: &[u8] = &[
        0x1E, // open 1
        0x0A, 0x9C, 0xA4, // ctx0 net number 40100
        0x19, 0x02, // ctx1
        0x29, 0x02, // ctx2 ip type
        0x3D, 0x10, 0x00, b'0', b'0', b'0', b'.', b'0', b'0', b'0', b'.', b'0', b'0', b'0', b'.',
        b'0', b'0', b'0', // ctx3 foreign address
        0x49, 0x3C, // ctx4 ttl
        0x5D, 0x0A, 0x00, b'1', b'0', b'.', b'1', b'.', b'2', b'.', b'3', b'0', // ctx5 proxy
        0x69, 0x00, 0x79, 0x00, 0x89, 0x00, // ctx6..8
        0x9A, 0xBA, 0xC0, // ctx9 port
        0xA9, 0x00, 0xB9, 0x00, 0xC9, 0x00, // ctx10..12
        0xDC, 0xFF, 0xFF, 0xFF, 0xFF, // ctx13
        0xE9, 0x00, // ctx14
        0xF9, 0x0F, 0x00, 0xF9, 0x10, 0x00, 0xF9, 0x11, 0x00, // ctx15..17
        0x1F, // close 1
    ];

    #[test]
    fn test_model_b_capture() {
        let record = SettingsRecord::decode_bytes(SettingsModel::ModelB, MODEL_B_CAPTURE).unwrap();
        assert_eq!(record.net_number(), 40100);
        assert_eq!(record.ip_type(), 2);
        assert_eq!(record.port(), 47808);
        assert_eq!(record.foreign_ttl(), 60);
        assert_eq!(record.foreign_address(), None);
        assert_eq!(record.proxy_address(), Some(Ipv4Addr::new(10, 1, 2, 30)));
        assert_eq!(
            record.encode_bytes(&SettingsPatch::new()).unwrap(),
            MODEL_B_CAPTURE
        );
    }

    #[test]
    fn test_model_b_proxy_patch_changes_only_proxy_tag() {
        let record = SettingsRecord::decode_bytes(SettingsModel::ModelB, MODEL_B_CAPTURE).unwrap();
        let patch = SettingsPatch::new().proxy_address(Ipv4Addr::new(203, 0, 113, 5));
        let patched = record.encode_bytes(&patch).unwrap();

        let start = 28;
        let old_end = start + 12;
        assert_eq!(&MODEL_B_CAPTURE[start..start + 2], &[0x5D, 0x0A]);
        assert_eq!(&patched[..start], &MODEL_B_CAPTURE[..start]);
        assert_eq!(&patched[start..start + 3], &[0x5D, 0x0C, 0x00]);
        assert_eq!(&patched[start + 3..start + 14], b"203.0.113.5");
        assert_eq!(&patched[start + 14..], &MODEL_B_CAPTURE[old_end..]);
    }

    #[test]
    fn test_model_a_template_round_trip() {
        let record = SettingsRecord::template(SettingsModel::ModelA);
        assert_eq!(record.net_number(), 40000);
        assert_eq!(record.port(), 0xBAC0);
        assert_eq!(record.foreign_address(), None);
        assert_eq!(record.foreign_ttl(), 60);

        let bytes = record.encode_bytes(&SettingsPatch::new()).unwrap();
        assert_eq!(&bytes[..4], &[0x0E, 0x09, 0x19, 0x19]);
        assert_eq!(SettingsRecord::decode_bytes(SettingsModel::ModelA, &bytes).unwrap(), record);
    }

    #[test]
    fn test_model_a_unset_proxy_reads_unspecified() {
        let record = SettingsRecord::template(SettingsModel::ModelA);
        let tags = record
            .encode(&SettingsPatch::new())
            .unwrap()
            .into_iter()
            .map(|tag| match tag {
                Tag::Context { context: 4, data } if data.len() == 4 => Tag::context(4, vec![0x00]),
                other => other,
            })
            .collect::<TagList>();
        let record = SettingsRecord::decode(SettingsModel::ModelA, &tags).unwrap();
        assert_eq!(record.proxy_address(), Some(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_wrong_model_is_schema_mismatch() {
        let bytes = SettingsRecord::template(SettingsModel::ModelA)
            .encode_bytes(&SettingsPatch::new())
            .unwrap();
        let error = SettingsRecord::decode_bytes(SettingsModel::ModelB, &bytes).unwrap_err();
        assert!(matches!(error, SettingsError::SchemaMismatch { slot: 0, .. }));
    }

    #[test]
    fn test_missing_and_trailing_tags() {
        let tags = SettingsRecord::template(SettingsModel::ModelB)
            .encode(&SettingsPatch::new())
            .unwrap();

        let mut short: Vec<Tag> = tags.iter().cloned().collect();
        short.remove(3);
        let error = SettingsRecord::decode(SettingsModel::ModelB, &TagList::from(short)).unwrap_err();
        assert!(matches!(error, SettingsError::SchemaMismatch { slot: 3, .. }));

        let mut long: Vec<Tag> = tags.iter().cloned().collect();
        long.push(Tag::context(0, vec![0x01]));
        let error = SettingsRecord::decode(SettingsModel::ModelB, &TagList::from(long)).unwrap_err();
        assert!(matches!(error, SettingsError::SchemaMismatch { slot: 20, .. }));
    }

    #[test]
    fn test_width_rules() {
        let mut tags: Vec<Tag> = SettingsRecord::template(SettingsModel::ModelB)
            .encode(&SettingsPatch::new())
            .unwrap()
            .into_iter()
            .collect();
        // Proxy address in UCS-2 is not a layout we know
        tags[6] = Tag::context(5, b"\x04\x00\x31".to_vec());
        let error =
            SettingsRecord::decode(SettingsModel::ModelB, &TagList::from(tags.clone())).unwrap_err();
        assert!(matches!(error, SettingsError::SchemaMismatch { slot: 6, .. }));

        // Three-octet port
        tags[6] = Tag::context(5, UNSET_TEXT_ADDRESS.to_vec());
        tags[10] = Tag::context(9, vec![0x00, 0xBA, 0xC0]);
        let error = SettingsRecord::decode(SettingsModel::ModelB, &TagList::from(tags)).unwrap_err();
        assert!(matches!(error, SettingsError::SchemaMismatch { slot: 10, .. }));
    }

    #[test]
    fn test_malformed_stream() {
        let error = SettingsRecord::decode_bytes(SettingsModel::ModelB, &[0x1E, 0x0A, 0x9C, 0xA4])
            .unwrap_err();
        assert!(matches!(error, SettingsError::MalformedTag(_)));
    }

    #[test]
    fn test_invalid_text_address_is_not_ipv4() {
        let mut tags: Vec<Tag> = SettingsRecord::template(SettingsModel::ModelB)
            .encode(&SettingsPatch::new())
            .unwrap()
            .into_iter()
            .collect();
        tags[6] = Tag::context(5, b"\x00not.an.ip".to_vec());
        let record = SettingsRecord::decode(SettingsModel::ModelB, &TagList::from(tags)).unwrap();
        assert_eq!(record.address_text(Field::ProxyAddress), "not.an.ip");
        assert_eq!(record.proxy_address(), None);
    }

    #[test]
    fn test_integer_patch_keeps_width() {
        let record = SettingsRecord::template(SettingsModel::ModelA);
        // ttl is stored in one octet; 60 -> 30 stays one octet, 600 widens
        let tags = record.encode(&SettingsPatch::new().foreign_ttl(30)).unwrap();
        let index = tag_index(SettingsModel::ModelA, Field::ForeignTtl).unwrap();
        assert_eq!(tags.as_slice()[index].data(), &[0x1E]);

        let tags = record.encode(&SettingsPatch::new().foreign_ttl(600)).unwrap();
        assert_eq!(tags.as_slice()[index].data(), &[0x02, 0x58]);

        // net number is stored in two octets; small values are padded
        let tags = record.encode(&SettingsPatch::new().net_number(5)).unwrap();
        let index = tag_index(SettingsModel::ModelA, Field::NetNumber).unwrap();
        assert_eq!(tags.as_slice()[index].data(), &[0x00, 0x05]);
    }

    #[test]
    fn test_opaque_blocks() {
        let blocks = SettingsRecord::template(SettingsModel::ModelA).opaque_blocks();
        let names: Vec<&str> = blocks.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            [
                "header",
                "context-1-2",
                "context-4",
                "block-5",
                "context-6-7",
                "block-8",
                "block-9-tail",
                "context-10-13"
            ]
        );
        assert_eq!(blocks[5].1.len(), 9);
    }

    #[test]
    fn test_six_and_seven_octet_slots_round_trip() {
        for model in MODELS {
            let mut record = SettingsRecord::template(model);
            let widths: Vec<Width> = model
                .schema()
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Value { width, .. } => Some(*width),
                    _ => None,
                })
                .collect();
            let mut length = 6;
            for (value, width) in record.values.iter_mut().zip(widths) {
                if width == Width::Any {
                    *value = Bytes::from(vec![0xA5; length]);
                    length = 13 - length;
                }
            }

            let bytes = record.encode_bytes(&SettingsPatch::new()).unwrap();
            assert_eq!(SettingsRecord::decode_bytes(model, &bytes).unwrap(), record);

            let proxy = Ipv4Addr::new(203, 0, 113, 5);
            let patched = record
                .encode_bytes(&SettingsPatch::new().proxy_address(proxy))
                .unwrap();
            let decoded = SettingsRecord::decode_bytes(model, &patched).unwrap();
            assert_eq!(decoded.proxy_address(), Some(proxy));
        }
    }

    fn slot_content(width: Width) -> BoxedStrategy<Vec<u8>> {
        match width {
            Width::Unsigned => prop::collection::vec(any::<u8>(), 1..=2).boxed(),
            Width::Octet => prop::collection::vec(any::<u8>(), 1..=1).boxed(),
            Width::RawAddress => prop_oneof![
                Just(vec![0x00]),
                prop::collection::vec(any::<u8>(), 4..=4)
            ]
            .boxed(),
            Width::TextAddress => "[0-9.]{0,15}"
                .prop_map(|text| {
                    let mut data = vec![charset::UTF8];
                    data.extend_from_slice(text.as_bytes());
                    data
                })
                .boxed(),
            Width::Any => prop::collection::vec(any::<u8>(), 0..9).boxed(),
        }
    }

    fn arb_record() -> impl Strategy<Value = SettingsRecord> {
        prop::sample::select(MODELS.to_vec()).prop_flat_map(|model| {
            let contents: Vec<BoxedStrategy<Vec<u8>>> = model
                .schema()
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Value { width, .. } => Some(slot_content(*width)),
                    _ => None,
                })
                .collect();
            contents.prop_map(move |values| SettingsRecord {
                model,
                values: values.into_iter().map(Bytes::from).collect(),
            })
        })
    }

    proptest! {
        #[test]
        fn test_decode_encode_round_trip(record in arb_record()) {
            let bytes = record.encode_bytes(&SettingsPatch::new()).unwrap();
            let decoded = SettingsRecord::decode_bytes(record.model(), &bytes).unwrap();
            prop_assert_eq!(decoded, record);
        }

        #[test]
        fn test_proxy_patch_is_local(record in arb_record(), octets in any::<[u8; 4]>()) {
            let address = Ipv4Addr::from(octets);
            let original = record.encode(&SettingsPatch::new()).unwrap();
            let patched = record.encode(&SettingsPatch::new().proxy_address(address)).unwrap();
            let index = tag_index(record.model(), Field::ProxyAddress).unwrap();

            prop_assert_eq!(original.len(), patched.len());
            for (i, (before, after)) in original.iter().zip(patched.iter()).enumerate() {
                if i != index {
                    prop_assert_eq!(before, after);
                }
            }

            let bytes = encoding::serialize(&patched).unwrap();
            let decoded = SettingsRecord::decode_bytes(record.model(), &bytes).unwrap();
            prop_assert_eq!(decoded.proxy_address(), Some(address));
            prop_assert_eq!(decoded.opaque_blocks(), record.opaque_blocks());
        }
    }
}
