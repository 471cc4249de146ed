//! BACnet Application Layer Services
//!
//! Request and response bodies for the services this crate speaks:
//!
//! - **Who-Is / I-Am**: locate a device and learn its address and instance
//! - **ReadProperty**: fetch one property (optionally one array element)
//! - **WriteProperty**: replace one property value
//! - **ReinitializeDevice**: restart a device or activate pending changes
//!
//! Property values travel as [`TagList`]s so proprietary constructed values
//! reach the settings codec untouched.
//!
//! Peer-reported failures (Error, Reject and Abort PDUs) are summarised as
//! [`ProtocolError`].
//!
//! # Example
//!
//! ```
//! use bacnet_proxy_ip::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
//! use bacnet_proxy_ip::service::ReadPropertyRequest;
//!
//! let request = ReadPropertyRequest::new(
//!     ObjectIdentifier::new(ObjectType::Proprietary(278), 1),
//!     PropertyIdentifier::Proprietary(1101),
//! )
//! .with_array_index(5);
//!
//! let mut buffer = Vec::new();
//! request.encode(&mut buffer).unwrap();
//! assert_eq!(buffer, vec![0x0C, 0x45, 0x80, 0x00, 0x01, 0x1A, 0x04, 0x4D, 0x29, 0x05]);
//! ```

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use crate::bacnet_enum;
use crate::encoding::{
    decode_character_string_octets, decode_unsigned_octets, encode_application_enumerated,
    encode_application_object_id, encode_application_unsigned, encode_closing_tag,
    encode_context_character_string, encode_context_enumerated, encode_context_object_id,
    encode_context_unsigned, encode_opening_tag, ApplicationTag, EncodingError,
    Result as EncodingResult, Tag, TagList,
};
use crate::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur while building or parsing service bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Underlying tag encoding failed
    Encoding(EncodingError),
    /// Body did not have the expected shape
    InvalidResponse(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Encoding(e) => write!(f, "Encoding error: {}", e),
            ServiceError::InvalidResponse(msg) => write!(f, "Invalid service data: {}", msg),
        }
    }
}

impl Error for ServiceError {}

impl From<EncodingError> for ServiceError {
    fn from(error: EncodingError) -> Self {
        ServiceError::Encoding(error)
    }
}

/// Confirmed service choices used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    ReadProperty = 12,
    WriteProperty = 15,
    ReinitializeDevice = 20,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            12 => Ok(ConfirmedServiceChoice::ReadProperty),
            15 => Ok(ConfirmedServiceChoice::WriteProperty),
            20 => Ok(ConfirmedServiceChoice::ReinitializeDevice),
            other => Err(ServiceError::InvalidResponse(format!(
                "unsupported confirmed service {}",
                other
            ))),
        }
    }
}

/// Unconfirmed service choices used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    WhoIs = 8,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(UnconfirmedServiceChoice::IAm),
            8 => Ok(UnconfirmedServiceChoice::WhoIs),
            other => Err(ServiceError::InvalidResponse(format!(
                "unsupported unconfirmed service {}",
                other
            ))),
        }
    }
}

bacnet_enum! {
    /// Error classes carried by Error PDUs
    ErrorClass: u32, proprietary 64..=65535 {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    }
}

bacnet_enum! {
    /// Error codes carried by Error PDUs
    ErrorCode: u32, proprietary 256..=65535 {
        Other = 0,
        ConfigurationInProgress = 2,
        DeviceBusy = 3,
        InconsistentParameters = 7,
        InvalidDataType = 9,
        MissingRequiredParameter = 16,
        NoSpaceForObject = 18,
        OperationalProblem = 25,
        PasswordFailure = 26,
        ReadAccessDenied = 27,
        ServiceRequestDenied = 29,
        Timeout = 30,
        UnknownObject = 31,
        UnknownProperty = 32,
        ValueOutOfRange = 37,
        WriteAccessDenied = 40,
        InvalidArrayIndex = 42,
        PropertyIsNotAnArray = 50,
        CommunicationDisabled = 83,
    }
}

bacnet_enum! {
    /// Reasons carried by Reject PDUs
    RejectReason: u8, proprietary 64..=255 {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    }
}

bacnet_enum! {
    /// Reasons carried by Abort PDUs
    AbortReason: u8, proprietary 64..=255 {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
    }
}

/// Failure reported by the peer for a confirmed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    Reject(RejectReason),
    Abort(AbortReason),
    Error { class: ErrorClass, code: ErrorCode },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Reject(reason) => write!(f, "reject: {}", reason),
            ProtocolError::Abort(reason) => write!(f, "abort: {}", reason),
            ProtocolError::Error { class, code } => write!(f, "error: {}/{}", class, code),
        }
    }
}

impl Error for ProtocolError {}

fn malformed(what: impl Into<String>) -> ServiceError {
    ServiceError::InvalidResponse(what.into())
}

fn context_unsigned(data: &[u8], what: &str) -> Result<u32> {
    decode_unsigned_octets(data).map_err(|_| malformed(format!("bad {}", what)))
}

fn expect_application(tag: Option<&Tag>, expected: ApplicationTag, what: &str) -> Result<Vec<u8>> {
    match tag {
        Some(Tag::Application { tag, data }) if *tag == expected as u8 => Ok(data.to_vec()),
        _ => Err(malformed(format!("missing {}", what))),
    }
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Low limit of device instance range (optional)
    pub low_limit: Option<u32>,
    /// High limit of device instance range (optional)
    pub high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Create a new Who-Is request for all devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Who-Is request for a specific device
    pub fn for_device(device_instance: u32) -> Self {
        Self::for_range(device_instance, device_instance)
    }

    /// Create a new Who-Is request for a range of devices
    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            low_limit: Some(low),
            high_limit: Some(high),
        }
    }

    /// Encode the Who-Is request. Limits are only sent as a pair.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encode_context_unsigned(buffer, 0, low)?;
            encode_context_unsigned(buffer, 1, high)?;
        }
        Ok(())
    }

    /// Decode a Who-Is request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let tags = TagList::parse(data)?;
        let mut cursor = tags.cursor();
        if cursor.is_empty() {
            return Ok(Self::new());
        }
        let low = context_unsigned(cursor.expect_context(0)?, "low limit")?;
        let high = cursor
            .optional_context(1)
            .ok_or_else(|| malformed("Who-Is request has low limit without high limit"))?;
        Ok(Self::for_range(low, context_unsigned(high, "high limit")?))
    }

    /// Check if this request matches a device instance
    pub fn matches(&self, device_instance: u32) -> bool {
        self.low_limit.map_or(true, |low| device_instance >= low)
            && self.high_limit.map_or(true, |high| device_instance <= high)
    }
}

/// I-Am announcement (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    /// Device object identifier
    pub device_identifier: ObjectIdentifier,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: u32,
    /// Segmentation supported
    pub segmentation_supported: u32,
    /// Vendor identifier
    pub vendor_identifier: u32,
}

impl IAmRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_application_object_id(buffer, self.device_identifier.to_wire()?)?;
        encode_application_unsigned(buffer, self.max_apdu_length_accepted)?;
        encode_application_enumerated(buffer, self.segmentation_supported)?;
        encode_application_unsigned(buffer, self.vendor_identifier)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let tags = TagList::parse(data)?;
        let mut cursor = tags.cursor();

        let id = expect_application(cursor.pop(), ApplicationTag::ObjectIdentifier, "device identifier")?;
        let device_identifier = ObjectIdentifier::from_octets(&id)?;
        if device_identifier.object_type != ObjectType::Device {
            return Err(malformed(format!("I-Am from non-device object {}", device_identifier)));
        }

        let max_apdu = expect_application(cursor.pop(), ApplicationTag::UnsignedInt, "max APDU")?;
        let segmentation = expect_application(cursor.pop(), ApplicationTag::Enumerated, "segmentation")?;
        let vendor = expect_application(cursor.pop(), ApplicationTag::UnsignedInt, "vendor identifier")?;

        Ok(Self {
            device_identifier,
            max_apdu_length_accepted: decode_unsigned_octets(&max_apdu)?,
            segmentation_supported: decode_unsigned_octets(&segmentation)?,
            vendor_identifier: decode_unsigned_octets(&vendor)?,
        })
    }
}

/// ReadProperty request (confirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object_identifier: ObjectIdentifier, property_identifier: PropertyIdentifier) -> Self {
        Self {
            object_identifier,
            property_identifier,
            array_index: None,
        }
    }

    pub fn with_array_index(mut self, array_index: u32) -> Self {
        self.array_index = Some(array_index);
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_object_id(buffer, 0, self.object_identifier.to_wire()?)?;
        encode_context_enumerated(buffer, 1, self.property_identifier.value())?;
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index)?;
        }
        Ok(())
    }
}

/// Shared head of ReadProperty-ACK and WriteProperty: object, property, index
fn decode_property_reference(
    cursor: &mut crate::encoding::TagCursor<'_>,
) -> Result<(ObjectIdentifier, PropertyIdentifier, Option<u32>)> {
    let object_identifier = ObjectIdentifier::from_octets(cursor.expect_context(0)?)?;
    let property_identifier = PropertyIdentifier::from(context_unsigned(
        cursor.expect_context(1)?,
        "property identifier",
    )?);
    let array_index = cursor
        .optional_context(2)
        .map(|data| context_unsigned(data, "array index"))
        .transpose()?;
    Ok((object_identifier, property_identifier, array_index))
}

/// ReadProperty-ACK body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub array_index: Option<u32>,
    /// Property value as found between opening and closing tag 3
    pub value: TagList,
}

impl ReadPropertyAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_object_id(buffer, 0, self.object_identifier.to_wire()?)?;
        encode_context_enumerated(buffer, 1, self.property_identifier.value())?;
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index)?;
        }
        encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value.encode()?);
        encode_closing_tag(buffer, 3)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let tags = TagList::parse(data)?;
        let mut cursor = tags.cursor();
        let (object_identifier, property_identifier, array_index) =
            decode_property_reference(&mut cursor)?;
        let value = cursor.take_group(3)?;
        if !cursor.is_empty() {
            return Err(malformed("trailing data after property value"));
        }
        Ok(Self {
            object_identifier,
            property_identifier,
            array_index,
            value,
        })
    }

    /// True when this acknowledges `request`
    pub fn answers(&self, request: &ReadPropertyRequest) -> bool {
        self.object_identifier == request.object_identifier
            && self.property_identifier == request.property_identifier
            && self.array_index == request.array_index
    }
}

/// WriteProperty request (confirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub value: TagList,
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn new(
        object_identifier: ObjectIdentifier,
        property_identifier: PropertyIdentifier,
        value: TagList,
    ) -> Self {
        Self {
            object_identifier,
            property_identifier,
            array_index: None,
            value,
            priority: None,
        }
    }

    pub fn with_array_index(mut self, array_index: u32) -> Self {
        self.array_index = Some(array_index);
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_object_id(buffer, 0, self.object_identifier.to_wire()?)?;
        encode_context_enumerated(buffer, 1, self.property_identifier.value())?;
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index)?;
        }
        encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value.encode()?);
        encode_closing_tag(buffer, 3)?;
        if let Some(priority) = self.priority {
            if !(1..=16).contains(&priority) {
                return Err(EncodingError::ValueOutOfRange);
            }
            encode_context_unsigned(buffer, 4, priority as u32)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let tags = TagList::parse(data)?;
        let mut cursor = tags.cursor();
        let (object_identifier, property_identifier, array_index) =
            decode_property_reference(&mut cursor)?;
        let value = cursor.take_group(3)?;
        let priority = cursor
            .optional_context(4)
            .map(|data| context_unsigned(data, "priority").map(|p| p as u8))
            .transpose()?;
        Ok(Self {
            object_identifier,
            property_identifier,
            array_index,
            value,
            priority,
        })
    }
}

/// States accepted by ReinitializeDevice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReinitializedState {
    ColdStart = 0,
    WarmStart = 1,
    StartBackup = 2,
    EndBackup = 3,
    StartRestore = 4,
    EndRestore = 5,
    AbortRestore = 6,
    ActivateChanges = 7,
}

impl FromStr for ReinitializedState {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "coldstart" | "0" => Ok(ReinitializedState::ColdStart),
            "warmstart" | "1" => Ok(ReinitializedState::WarmStart),
            "startbackup" | "2" => Ok(ReinitializedState::StartBackup),
            "endbackup" | "3" => Ok(ReinitializedState::EndBackup),
            "startrestore" | "4" => Ok(ReinitializedState::StartRestore),
            "endrestore" | "5" => Ok(ReinitializedState::EndRestore),
            "abortrestore" | "6" => Ok(ReinitializedState::AbortRestore),
            "activatechanges" | "7" => Ok(ReinitializedState::ActivateChanges),
            _ => Err(malformed(format!("unknown reinitialize state {:?}", s))),
        }
    }
}

/// ReinitializeDevice request (confirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinitializeDeviceRequest {
    pub state: ReinitializedState,
    pub password: Option<String>,
}

impl ReinitializeDeviceRequest {
    pub fn new(state: ReinitializedState) -> Self {
        Self { state, password: None }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_enumerated(buffer, 0, self.state as u32)?;
        if let Some(password) = &self.password {
            if password.is_empty() || password.len() > 20 {
                return Err(EncodingError::InvalidLength);
            }
            encode_context_character_string(buffer, 1, password)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let tags = TagList::parse(data)?;
        let mut cursor = tags.cursor();
        let state = match context_unsigned(cursor.expect_context(0)?, "state")? {
            value @ 0..=7 => ReinitializedState::from_str(&value.to_string())?,
            other => return Err(malformed(format!("unknown reinitialize state {}", other))),
        };
        let password = cursor
            .optional_context(1)
            .map(decode_character_string_octets)
            .transpose()?;
        Ok(Self { state, password })
    }
}
