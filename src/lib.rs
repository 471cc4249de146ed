#![doc = include_str!("../README.md")]

pub mod app;
pub mod client;
pub mod config;
pub mod encoding;
pub mod network;
pub mod object;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod transport;
pub mod util;
pub mod workflow;

#[doc(hidden)]
pub use pastey as __pastey;

// Re-export main types without glob imports to avoid conflicts
pub use client::{BacnetIpClient, ClientError, DiscoveredDevice, ProtocolStack};
pub use encoding::{ApplicationTag, EncodingError, Tag, TagList};
pub use object::{ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyValue};
pub use resolver::{FixedAddress, PublicAddressResolver, ResolverError};
pub use service::{ProtocolError, ServiceError};
pub use settings::{SettingsError, SettingsModel, SettingsPatch, SettingsRecord};
pub use workflow::{Completion, CorrectionWorkflow, FailureReason, Session, SessionConfig};
