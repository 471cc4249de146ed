//! Which layout a device uses, and where it keeps it.
//!
//! Selection keys on the device's model name (case-insensitive prefix) and
//! on the firmware release, the first `major.minor` found in its application
//! software version.

use crate::encoding::TagList;
use crate::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
use crate::service::{ReadPropertyRequest, WritePropertyRequest};

use super::{Result, SettingsError, SettingsModel};

/// Object, property and array index holding a device's settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsLocation {
    pub model: SettingsModel,
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl SettingsLocation {
    pub fn new(
        model: SettingsModel,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        array_index: Option<u32>,
    ) -> Self {
        Self {
            model,
            object,
            property,
            array_index,
        }
    }

    pub fn read_request(&self) -> ReadPropertyRequest {
        ReadPropertyRequest {
            object_identifier: self.object,
            property_identifier: self.property,
            array_index: self.array_index,
        }
    }

    pub fn write_request(&self, value: TagList) -> WritePropertyRequest {
        WritePropertyRequest {
            object_identifier: self.object,
            property_identifier: self.property,
            array_index: self.array_index,
            value,
            priority: None,
        }
    }
}

const BCP_OBJECT: u16 = 162;
const BCP_SETTINGS: u32 = 1034;
const NET_OBJECT: u16 = 278;
const NET_SETTINGS: u32 = 1101;

/// Oldest and newest supported releases, as (major, minor)
const RELEASES: ((u32, u32), (u32, u32)) = ((3, 40), (3, 99));

struct Family {
    prefix: &'static str,
    model: SettingsModel,
    array_index: u32,
}

static FAMILIES: &[Family] = &[
    Family {
        prefix: "DSC",
        model: SettingsModel::ModelB,
        array_index: 5,
    },
    Family {
        prefix: "DSM-RTR",
        model: SettingsModel::ModelB,
        array_index: 6,
    },
    Family {
        prefix: "eBMGR",
        model: SettingsModel::ModelB,
        array_index: 6,
    },
    Family {
        prefix: "eTCH",
        model: SettingsModel::ModelA,
        array_index: 2,
    },
    Family {
        prefix: "DCU",
        model: SettingsModel::ModelA,
        array_index: 2,
    },
];

fn settings_object(model: SettingsModel) -> (ObjectIdentifier, PropertyIdentifier) {
    let (object_type, property) = match model {
        SettingsModel::ModelA => (BCP_OBJECT, BCP_SETTINGS),
        SettingsModel::ModelB => (NET_OBJECT, NET_SETTINGS),
    };
    (
        ObjectIdentifier::new(ObjectType::from(object_type), 1),
        PropertyIdentifier::from(property),
    )
}

/// First `major.minor` in a version string: `"V3.40 (build 1234)"` gives `(3, 40)`.
///
/// The minor is an integer, not a decimal fraction: `"3.5"` is `(3, 5)` and
/// sorts before `"3.40"`.
pub fn firmware_release(version: &str) -> Option<(u32, u32)> {
    let bytes = version.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let major_end = start + bytes[start..].iter().take_while(|b| b.is_ascii_digit()).count();
        if bytes.get(major_end) == Some(&b'.') {
            let minor_start = major_end + 1;
            let minor_len = bytes[minor_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            if minor_len > 0 {
                let major = version[start..major_end].parse().ok()?;
                let minor = version[minor_start..minor_start + minor_len].parse().ok()?;
                return Some((major, minor));
            }
        }
        start = major_end;
    }
    None
}

/// Settings location for a device, from its model name and software version
pub fn select(model_name: &str, software_version: &str) -> Result<SettingsLocation> {
    let unknown = || SettingsError::UnknownModel {
        model: model_name.to_string(),
        version: software_version.to_string(),
    };

    let release = firmware_release(software_version).ok_or_else(unknown)?;
    let (oldest, newest) = RELEASES;
    if release < oldest || release > newest {
        return Err(unknown());
    }

    let name = model_name.trim();
    let family = FAMILIES
        .iter()
        .find(|family| {
            name.get(..family.prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(family.prefix))
        })
        .ok_or_else(unknown)?;

    let (object, property) = settings_object(family.model);
    log::debug!(
        "{} firmware {}.{} uses {} at {} property {}[{}]",
        name,
        release.0,
        release.1,
        family.model,
        object,
        property,
        family.array_index
    );
    Ok(SettingsLocation::new(
        family.model,
        object,
        property,
        Some(family.array_index),
    ))
}

/// Layout implied by a raw object type and property
pub fn infer_model(object_type: ObjectType, property: PropertyIdentifier) -> Option<SettingsModel> {
    match (object_type.value(), property.value()) {
        (BCP_OBJECT, BCP_SETTINGS) => Some(SettingsModel::ModelA),
        (NET_OBJECT, NET_SETTINGS) => Some(SettingsModel::ModelB),
        _ => None,
    }
}
