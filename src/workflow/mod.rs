//! Proxy address correction workflow
//!
//! [`CorrectionWorkflow`] is a sans-IO state machine. It never touches the
//! network: [`CorrectionWorkflow::start`] returns the first [`Command`], and
//! every [`Event`] fed to [`CorrectionWorkflow::handle`] may yield the next.
//! [`session::Session`] executes the commands against a
//! [`ProtocolStack`](crate::client::ProtocolStack) and a
//! [`PublicAddressResolver`](crate::resolver::PublicAddressResolver).
//!
//! ```text
//! Idle -> Discovering -> ResolvingIdentity -> SelectingSchema -> ReadingSettings
//!      -> ResolvingPublicAddress -> Comparing -> [WritingSettings -> AwaitingAck]
//!      -> Done | Failed
//! ```
//!
//! Exactly one command is outstanding at a time. Each carries a
//! [`RequestToken`]; events echoing any other token, or arriving in a state
//! that does not expect them, are dropped.

pub mod queue;
pub mod session;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;

use crate::client::{device_object, DiscoveredDevice};
use crate::encoding::TagList;
use crate::object::{PropertyIdentifier, PropertyValue};
use crate::service::{ProtocolError, ReadPropertyRequest, WritePropertyRequest};
use crate::settings::{
    self, Field, SettingsError, SettingsLocation, SettingsPatch, SettingsRecord,
};
use crate::util::parse_ipv4;

pub use queue::{PropertyPoint, PropertyReadQueue, ReadOutcome};
pub use session::{Session, SessionConfig};

/// Steps that wait on the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    ResolvingIdentity,
    ReadingSettings,
    ResolvingPublicAddress,
    WritingSettings,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Discovering => "discovery",
            Phase::ResolvingIdentity => "identity read",
            Phase::ReadingSettings => "settings read",
            Phase::ResolvingPublicAddress => "public address lookup",
            Phase::WritingSettings => "settings write",
        };
        f.write_str(name)
    }
}

/// Why a run ended without completing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("settings are not a well-formed tag stream: {0}")]
    MalformedTag(String),
    #[error("settings do not match the expected layout: {0}")]
    SchemaMismatch(String),
    #[error("no settings layout for model {model:?} firmware {version:?}")]
    UnknownModel { model: String, version: String },
    #[error("device refused the request: {0}")]
    Protocol(ProtocolError),
    #[error("not an IPv4 address: {0:?}")]
    InvalidAddress(String),
    #[error("public address lookup failed: {0}")]
    ResolverUnavailable(String),
    #[error("no response during {0}")]
    NoResponse(Phase),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<SettingsError> for FailureReason {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::MalformedTag(e) => FailureReason::MalformedTag(e.to_string()),
            SettingsError::UnknownModel { model, version } => {
                FailureReason::UnknownModel { model, version }
            }
            other @ (SettingsError::SchemaMismatch { .. } | SettingsError::InvalidValue { .. }) => {
                FailureReason::SchemaMismatch(other.to_string())
            }
        }
    }
}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The proxy address already matched
    AlreadyCurrent(Ipv4Addr),
    /// The proxy address was rewritten
    Corrected { from: Ipv4Addr, to: Ipv4Addr },
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::AlreadyCurrent(address) => {
                write!(f, "proxy address {} is already current", address)
            }
            Completion::Corrected { from, to } => {
                write!(f, "proxy address corrected from {} to {}", from, to)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Discovering,
    ResolvingIdentity,
    SelectingSchema,
    ReadingSettings,
    ResolvingPublicAddress,
    Comparing,
    WritingSettings,
    AwaitingAck,
    Done(Completion),
    Failed(FailureReason),
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done(_) | WorkflowState::Failed(_))
    }
}

/// Identifies one issued command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(pub u32);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work the driver must perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Discover {
        token: RequestToken,
        destination: Option<SocketAddr>,
        range: Option<(u32, u32)>,
    },
    ReadProperty {
        token: RequestToken,
        address: SocketAddr,
        request: ReadPropertyRequest,
    },
    ResolvePublicAddress {
        token: RequestToken,
    },
    WriteProperty {
        token: RequestToken,
        address: SocketAddr,
        request: WritePropertyRequest,
    },
}

impl Command {
    pub fn token(&self) -> RequestToken {
        match self {
            Command::Discover { token, .. }
            | Command::ReadProperty { token, .. }
            | Command::ResolvePublicAddress { token }
            | Command::WriteProperty { token, .. } => *token,
        }
    }
}

/// Why a request produced no usable answer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestFailure {
    #[error("{0}")]
    Protocol(ProtocolError),
    #[error("no response")]
    NoResponse,
    #[error("undecodable reply: {0}")]
    Malformed(String),
    #[error("{0}")]
    Transport(String),
}

/// Completions fed back by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeviceFound {
        token: RequestToken,
        device: DiscoveredDevice,
    },
    PropertyValue {
        token: RequestToken,
        value: TagList,
    },
    PublicAddress {
        token: RequestToken,
        address: String,
    },
    ResolverFailed {
        token: RequestToken,
        reason: String,
    },
    WriteAcknowledged {
        token: RequestToken,
    },
    RequestFailed {
        token: RequestToken,
        failure: RequestFailure,
    },
}

impl Event {
    pub fn token(&self) -> RequestToken {
        match self {
            Event::DeviceFound { token, .. }
            | Event::PropertyValue { token, .. }
            | Event::PublicAddress { token, .. }
            | Event::ResolverFailed { token, .. }
            | Event::WriteAcknowledged { token }
            | Event::RequestFailed { token, .. } => *token,
        }
    }
}

/// Which device to correct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    /// Unicast Who-Is here instead of broadcasting
    pub address: Option<SocketAddr>,
    /// Only accept this device instance
    pub device_instance: Option<u32>,
    /// Only accept device instances in `low..=high`; ignored when
    /// `device_instance` is set
    pub range: Option<(u32, u32)>,
}

impl Target {
    /// Instance range carried by the Who-Is
    pub fn instance_range(&self) -> Option<(u32, u32)> {
        self.device_instance
            .map(|instance| (instance, instance))
            .or(self.range)
    }

    pub fn accepts(&self, device_id: u32) -> bool {
        match self.instance_range() {
            Some((low, high)) => (low..=high).contains(&device_id),
            None => true,
        }
    }
}

/// The correction state machine
#[derive(Debug)]
pub struct CorrectionWorkflow {
    target: Target,
    state: WorkflowState,
    next_token: u32,
    outstanding: Option<RequestToken>,
    device: Option<DiscoveredDevice>,
    identity: PropertyReadQueue,
    location: Option<SettingsLocation>,
    settings: Option<SettingsRecord>,
    proxy_address: Option<Ipv4Addr>,
    public_address: Option<Ipv4Addr>,
}

impl CorrectionWorkflow {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            state: WorkflowState::Idle,
            next_token: 1,
            outstanding: None,
            device: None,
            identity: PropertyReadQueue::new(),
            location: None,
            settings: None,
            proxy_address: None,
            public_address: None,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Final result once the run has ended
    pub fn outcome(&self) -> Option<Result<Completion, FailureReason>> {
        match &self.state {
            WorkflowState::Done(completion) => Some(Ok(*completion)),
            WorkflowState::Failed(reason) => Some(Err(reason.clone())),
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    pub fn identity(&self) -> &PropertyReadQueue {
        &self.identity
    }

    pub fn location(&self) -> Option<&SettingsLocation> {
        self.location.as_ref()
    }

    pub fn settings(&self) -> Option<&SettingsRecord> {
        self.settings.as_ref()
    }

    /// Token of the command awaiting its event
    pub fn outstanding(&self) -> Option<RequestToken> {
        self.outstanding
    }

    /// Leave `Idle` and issue the Who-Is. A workflow runs once: any state
    /// other than `Idle` yields None and is left untouched.
    pub fn start(&mut self) -> Option<Command> {
        if self.state != WorkflowState::Idle {
            log::warn!("workflow already started ({:?})", self.state);
            return None;
        }
        self.transition(WorkflowState::Discovering);
        let token = self.issue();
        Some(Command::Discover {
            token,
            destination: self.target.address,
            range: self.target.instance_range(),
        })
    }

    /// Feed a completion. Returns the next command, or None when the event
    /// was dropped or the run has ended.
    pub fn handle(&mut self, event: Event) -> Option<Command> {
        if self.outstanding != Some(event.token()) {
            log::debug!(
                "discarding stale event {} (outstanding {:?})",
                event.token(),
                self.outstanding
            );
            return None;
        }

        match (self.state.clone(), event) {
            (WorkflowState::Discovering, Event::DeviceFound { device, .. }) => {
                self.on_device_found(device)
            }
            (WorkflowState::ResolvingIdentity, Event::PropertyValue { value, .. }) => {
                self.on_identity(ReadOutcome::Value(PropertyValue::from_tags(&value)))
            }
            (WorkflowState::ResolvingIdentity, Event::RequestFailed { failure, .. }) => {
                match failure {
                    RequestFailure::Transport(reason) => self.fail(FailureReason::Transport(reason)),
                    failure => self.on_identity(ReadOutcome::Failed(failure)),
                }
            }
            (WorkflowState::ReadingSettings, Event::PropertyValue { value, .. }) => {
                self.on_settings(&value)
            }
            (WorkflowState::ResolvingPublicAddress, Event::PublicAddress { address, .. }) => {
                self.on_public_address(&address)
            }
            (WorkflowState::ResolvingPublicAddress, Event::ResolverFailed { reason, .. }) => {
                self.fail(FailureReason::ResolverUnavailable(reason))
            }
            (WorkflowState::AwaitingAck, Event::WriteAcknowledged { .. }) => {
                let completion = match (self.proxy_address, self.public_address) {
                    (Some(from), Some(to)) => Completion::Corrected { from, to },
                    _ => {
                        let reason = "write acknowledged without a pending change".to_string();
                        return self.fail(FailureReason::Transport(reason));
                    }
                };
                self.finish(completion)
            }
            (state, Event::RequestFailed { failure, .. }) => match Self::phase_of(&state) {
                Some(phase) => self.fail(match failure {
                    RequestFailure::Protocol(error) => FailureReason::Protocol(error),
                    RequestFailure::NoResponse => FailureReason::NoResponse(phase),
                    RequestFailure::Malformed(reason) if phase == Phase::ReadingSettings => {
                        FailureReason::MalformedTag(reason)
                    }
                    RequestFailure::Malformed(reason) | RequestFailure::Transport(reason) => {
                        FailureReason::Transport(reason)
                    }
                }),
                None => {
                    log::warn!("dropping failure in state {:?}: {}", state, failure);
                    None
                }
            },
            (state, event) => {
                log::warn!("dropping {:?} in state {:?}", event, state);
                None
            }
        }
    }

    fn phase_of(state: &WorkflowState) -> Option<Phase> {
        match state {
            WorkflowState::Discovering => Some(Phase::Discovering),
            WorkflowState::ResolvingIdentity => Some(Phase::ResolvingIdentity),
            WorkflowState::ReadingSettings => Some(Phase::ReadingSettings),
            WorkflowState::ResolvingPublicAddress => Some(Phase::ResolvingPublicAddress),
            WorkflowState::AwaitingAck => Some(Phase::WritingSettings),
            _ => None,
        }
    }

    fn issue(&mut self) -> RequestToken {
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        self.outstanding = Some(token);
        token
    }

    fn transition(&mut self, next: WorkflowState) {
        log::debug!("workflow {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, reason: FailureReason) -> Option<Command> {
        log::warn!("correction failed: {}", reason);
        self.outstanding = None;
        self.transition(WorkflowState::Failed(reason));
        None
    }

    fn finish(&mut self, completion: Completion) -> Option<Command> {
        log::info!("{}", completion);
        self.outstanding = None;
        self.transition(WorkflowState::Done(completion));
        None
    }

    fn on_device_found(&mut self, device: DiscoveredDevice) -> Option<Command> {
        if !self.target.accepts(device.device_id) {
            log::debug!("ignoring I-Am from device {}", device.device_id);
            return None;
        }
        log::info!("found device {} at {}", device.device_id, device.address);
        self.device = Some(device);

        let object = device_object(device.device_id);
        for property in [
            PropertyIdentifier::ModelName,
            PropertyIdentifier::ApplicationSoftwareVersion,
        ] {
            self.identity
                .enqueue(PropertyPoint::new(device.address, object, property));
        }
        self.transition(WorkflowState::ResolvingIdentity);
        self.next_identity_read()
    }

    fn next_identity_read(&mut self) -> Option<Command> {
        match self.identity.pop_next() {
            Some(point) => {
                let token = self.issue();
                Some(Command::ReadProperty {
                    token,
                    address: point.address,
                    request: point.read_request(),
                })
            }
            None => self.select_schema(),
        }
    }

    fn on_identity(&mut self, outcome: ReadOutcome) -> Option<Command> {
        if let ReadOutcome::Failed(failure) = &outcome {
            log::warn!("identity read failed: {}", failure);
        }
        self.identity.record(outcome);
        self.next_identity_read()
    }

    fn identity_text(&self, index: usize) -> String {
        self.identity
            .results()
            .get(index)
            .and_then(ReadOutcome::value)
            .and_then(PropertyValue::as_text)
            .unwrap_or_default()
            .to_string()
    }

    fn select_schema(&mut self) -> Option<Command> {
        self.transition(WorkflowState::SelectingSchema);
        let model = self.identity_text(0);
        let version = self.identity_text(1);
        let location = match settings::select(&model, &version) {
            Ok(location) => location,
            Err(e) => return self.fail(e.into()),
        };
        log::info!("{} {} keeps settings as {}", model, version, location.model);
        self.location = Some(location);

        let address = self.device.map(|device| device.address)?;
        self.transition(WorkflowState::ReadingSettings);
        let token = self.issue();
        Some(Command::ReadProperty {
            token,
            address,
            request: location.read_request(),
        })
    }

    fn on_settings(&mut self, value: &TagList) -> Option<Command> {
        let model = self.location.as_ref()?.model;
        let record = match SettingsRecord::decode(model, value) {
            Ok(record) => record,
            Err(e) => return self.fail(e.into()),
        };
        log::debug!("current settings:\n{}", record);
        self.settings = Some(record);

        self.transition(WorkflowState::ResolvingPublicAddress);
        let token = self.issue();
        Some(Command::ResolvePublicAddress { token })
    }

    fn on_public_address(&mut self, text: &str) -> Option<Command> {
        self.transition(WorkflowState::Comparing);
        let Some(public) = parse_ipv4(text.trim()) else {
            return self.fail(FailureReason::InvalidAddress(text.to_string()));
        };
        let record = self.settings.as_ref()?;
        let Some(proxy) = record.proxy_address() else {
            let stored = record.address_text(Field::ProxyAddress);
            return self.fail(FailureReason::InvalidAddress(stored));
        };
        self.proxy_address = Some(proxy);
        self.public_address = Some(public);

        if proxy == public {
            return self.finish(Completion::AlreadyCurrent(proxy));
        }

        log::info!("proxy address {} differs from public address {}", proxy, public);
        let patch = SettingsPatch::new().proxy_address(public);
        let encoded = record.encode(&patch);
        self.transition(WorkflowState::WritingSettings);
        let value = match encoded {
            Ok(value) => value,
            Err(e) => return self.fail(e.into()),
        };
        let (Some(location), Some(device)) = (self.location, self.device) else {
            return None;
        };

        self.transition(WorkflowState::AwaitingAck);
        let token = self.issue();
        Some(Command::WriteProperty {
            token,
            address: device.address,
            request: location.write_request(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{ApplicationTag, Tag};
    use crate::service::{ErrorClass, ErrorCode};
    use crate::settings::SettingsModel;

    fn device() -> DiscoveredDevice {
        DiscoveredDevice {
            address: "192.168.1.50:47808".parse().unwrap(),
            device_id: 1200,
            vendor_id: 8,
            max_apdu: 480,
        }
    }

    fn text(value: &str) -> TagList {
        let mut data = vec![0x00];
        data.extend_from_slice(value.as_bytes());
        TagList::from(vec![Tag::application(ApplicationTag::CharacterString, data)])
    }

    fn model_a_settings(proxy: Ipv4Addr) -> TagList {
        SettingsRecord::template(SettingsModel::ModelA)
            .encode(&SettingsPatch::new().proxy_address(proxy))
            .unwrap()
    }

    /// Drive a workflow through discovery and identity for an eTCH controller
    fn at_settings_read() -> (CorrectionWorkflow, Command) {
        let mut workflow = CorrectionWorkflow::new(Target {
            address: None,
            device_instance: Some(1200),
            range: None,
        });
        let discover = workflow.start().unwrap();
        assert!(matches!(
            discover,
            Command::Discover {
                range: Some((1200, 1200)),
                ..
            }
        ));

        let read_model = workflow
            .handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            })
            .unwrap();
        let read_version = workflow
            .handle(Event::PropertyValue {
                token: read_model.token(),
                value: text("eTCH-2000"),
            })
            .unwrap();
        let read_settings = workflow
            .handle(Event::PropertyValue {
                token: read_version.token(),
                value: text("3.40"),
            })
            .unwrap();
        assert_eq!(workflow.state(), &WorkflowState::ReadingSettings);
        (workflow, read_settings)
    }

    #[test]
    fn test_scenario_proxy_corrected() {
        let (mut workflow, read_settings) = at_settings_read();
        let Command::ReadProperty { request, .. } = &read_settings else {
            panic!("expected settings read, got {:?}", read_settings);
        };
        assert_eq!(request.object_identifier.object_type.value(), 162);
        assert_eq!(request.array_index, Some(2));

        let original = model_a_settings(Ipv4Addr::new(10, 0, 0, 1));
        let resolve = workflow
            .handle(Event::PropertyValue {
                token: read_settings.token(),
                value: original.clone(),
            })
            .unwrap();
        assert!(matches!(resolve, Command::ResolvePublicAddress { .. }));

        let write = workflow
            .handle(Event::PublicAddress {
                token: resolve.token(),
                address: "203.0.113.5".into(),
            })
            .unwrap();
        assert_eq!(workflow.state(), &WorkflowState::AwaitingAck);
        let Command::WriteProperty { request, address, .. } = &write else {
            panic!("expected write, got {:?}", write);
        };
        assert_eq!(*address, device().address);

        let before = crate::encoding::serialize(&original).unwrap();
        let after = crate::encoding::serialize(&request.value).unwrap();
        assert_eq!(before.len(), after.len());
        let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
        let proxy_at = before
            .windows(5)
            .position(|window| window == [0x4C, 10, 0, 0, 1])
            .unwrap();
        assert!(changed.iter().all(|i| (proxy_at + 1..proxy_at + 5).contains(i)));
        assert_eq!(&after[proxy_at + 1..proxy_at + 5], &[203, 0, 113, 5]);

        assert_eq!(
            workflow.handle(Event::WriteAcknowledged { token: write.token() }),
            None
        );
        assert_eq!(
            workflow.outcome(),
            Some(Ok(Completion::Corrected {
                from: Ipv4Addr::new(10, 0, 0, 1),
                to: Ipv4Addr::new(203, 0, 113, 5)
            }))
        );
    }

    #[test]
    fn test_scenario_already_current() {
        let (mut workflow, read_settings) = at_settings_read();
        let resolve = workflow
            .handle(Event::PropertyValue {
                token: read_settings.token(),
                value: model_a_settings(Ipv4Addr::new(203, 0, 113, 5)),
            })
            .unwrap();
        let next = workflow.handle(Event::PublicAddress {
            token: resolve.token(),
            address: "203.0.113.5".into(),
        });
        assert_eq!(next, None);
        assert_eq!(
            workflow.outcome(),
            Some(Ok(Completion::AlreadyCurrent(Ipv4Addr::new(203, 0, 113, 5))))
        );
    }

    #[test]
    fn test_scenario_invalid_public_address() {
        let (mut workflow, read_settings) = at_settings_read();
        let resolve = workflow
            .handle(Event::PropertyValue {
                token: read_settings.token(),
                value: model_a_settings(Ipv4Addr::new(10, 0, 0, 1)),
            })
            .unwrap();
        let next = workflow.handle(Event::PublicAddress {
            token: resolve.token(),
            address: "not.an.ip".into(),
        });
        assert_eq!(next, None);
        assert_eq!(
            workflow.outcome(),
            Some(Err(FailureReason::InvalidAddress("not.an.ip".into())))
        );
    }

    #[test]
    fn test_scenario_identity_errors_recorded_in_position() {
        let mut workflow = CorrectionWorkflow::new(Target::default());
        let discover = workflow.start().unwrap();
        let read_model = workflow
            .handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            })
            .unwrap();
        let failure = RequestFailure::Protocol(ProtocolError::Error {
            class: ErrorClass::Property,
            code: ErrorCode::UnknownProperty,
        });
        let read_version = workflow
            .handle(Event::RequestFailed {
                token: read_model.token(),
                failure: failure.clone(),
            })
            .unwrap();
        assert_eq!(workflow.state(), &WorkflowState::ResolvingIdentity);

        let next = workflow.handle(Event::PropertyValue {
            token: read_version.token(),
            value: text("3.40"),
        });
        assert_eq!(next, None);

        let results = workflow.identity().results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], ReadOutcome::Failed(failure));
        assert_eq!(
            results[1],
            ReadOutcome::Value(PropertyValue::CharacterString("3.40".into()))
        );
        assert_eq!(
            workflow.outcome(),
            Some(Err(FailureReason::UnknownModel {
                model: String::new(),
                version: "3.40".into()
            }))
        );
    }

    #[test]
    fn test_stale_and_duplicate_events_discarded() {
        let mut workflow = CorrectionWorkflow::new(Target::default());
        let discover = workflow.start().unwrap();
        let read_model = workflow
            .handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            })
            .unwrap();

        // Duplicate I-Am for the finished discovery
        assert_eq!(
            workflow.handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            }),
            None
        );
        // Right token, wrong kind of event
        assert_eq!(
            workflow.handle(Event::WriteAcknowledged {
                token: read_model.token()
            }),
            None
        );
        // Token never issued
        assert_eq!(
            workflow.handle(Event::PropertyValue {
                token: RequestToken(99),
                value: text("DSC-1616"),
            }),
            None
        );
        assert_eq!(workflow.state(), &WorkflowState::ResolvingIdentity);
        assert_eq!(workflow.outstanding(), Some(read_model.token()));
        assert!(workflow.identity().results().is_empty());
    }

    #[test]
    fn test_out_of_range_i_am_ignored() {
        let mut workflow = CorrectionWorkflow::new(Target {
            address: None,
            device_instance: Some(1200),
            range: None,
        });
        let discover = workflow.start().unwrap();
        let mut other = device();
        other.device_id = 77;
        assert_eq!(
            workflow.handle(Event::DeviceFound {
                token: discover.token(),
                device: other,
            }),
            None
        );
        assert_eq!(workflow.state(), &WorkflowState::Discovering);
        assert!(workflow
            .handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            })
            .is_some());
    }

    #[test]
    fn test_instance_range_filters_i_am() {
        let mut workflow = CorrectionWorkflow::new(Target {
            address: None,
            device_instance: None,
            range: Some((1000, 1999)),
        });
        let discover = workflow.start().unwrap();
        assert!(matches!(
            discover,
            Command::Discover {
                range: Some((1000, 1999)),
                ..
            }
        ));
        let mut below = device();
        below.device_id = 77;
        let mut above = device();
        above.device_id = 2000;
        for outside in [below, above] {
            assert_eq!(
                workflow.handle(Event::DeviceFound {
                    token: discover.token(),
                    device: outside,
                }),
                None
            );
        }
        assert_eq!(workflow.state(), &WorkflowState::Discovering);
        assert!(workflow
            .handle(Event::DeviceFound {
                token: discover.token(),
                device: device(),
            })
            .is_some());
        assert_eq!(workflow.device().map(|d| d.device_id), Some(1200));
    }

    #[test]
    fn test_device_instance_overrides_range() {
        let target = Target {
            address: None,
            device_instance: Some(5),
            range: Some((1000, 1999)),
        };
        assert_eq!(target.instance_range(), Some((5, 5)));
        assert!(target.accepts(5));
        assert!(!target.accepts(1200));
        assert!(Target::default().accepts(4_194_302));
    }

    #[test]
    fn test_start_only_leaves_idle() {
        let mut workflow = CorrectionWorkflow::new(Target::default());
        let discover = workflow.start().unwrap();
        assert_eq!(workflow.start(), None);
        assert_eq!(workflow.state(), &WorkflowState::Discovering);
        assert_eq!(workflow.outstanding(), Some(discover.token()));

        workflow.handle(Event::RequestFailed {
            token: discover.token(),
            failure: RequestFailure::NoResponse,
        });
        let failed = WorkflowState::Failed(FailureReason::NoResponse(Phase::Discovering));
        assert_eq!(workflow.state(), &failed);
        assert_eq!(workflow.start(), None);
        assert_eq!(workflow.state(), &failed);
        assert_eq!(workflow.outstanding(), None);
    }

    #[test]
    fn test_settings_failures() {
        let (mut workflow, read_settings) = at_settings_read();
        let wrong_layout = SettingsRecord::template(SettingsModel::ModelB)
            .encode(&SettingsPatch::new())
            .unwrap();
        workflow.handle(Event::PropertyValue {
            token: read_settings.token(),
            value: wrong_layout,
        });
        assert!(matches!(
            workflow.outcome(),
            Some(Err(FailureReason::SchemaMismatch(_)))
        ));

        let (mut workflow, read_settings) = at_settings_read();
        workflow.handle(Event::RequestFailed {
            token: read_settings.token(),
            failure: RequestFailure::NoResponse,
        });
        assert_eq!(
            workflow.outcome(),
            Some(Err(FailureReason::NoResponse(Phase::ReadingSettings)))
        );

        let (mut workflow, read_settings) = at_settings_read();
        workflow.handle(Event::RequestFailed {
            token: read_settings.token(),
            failure: RequestFailure::Malformed("opening tag 9 is never closed".into()),
        });
        assert!(matches!(
            workflow.outcome(),
            Some(Err(FailureReason::MalformedTag(_)))
        ));
    }

    #[test]
    fn test_write_rejected() {
        let (mut workflow, read_settings) = at_settings_read();
        let resolve = workflow
            .handle(Event::PropertyValue {
                token: read_settings.token(),
                value: model_a_settings(Ipv4Addr::new(10, 0, 0, 1)),
            })
            .unwrap();
        let write = workflow
            .handle(Event::PublicAddress {
                token: resolve.token(),
                address: "203.0.113.5".into(),
            })
            .unwrap();
        let error = ProtocolError::Error {
            class: ErrorClass::Property,
            code: ErrorCode::WriteAccessDenied,
        };
        workflow.handle(Event::RequestFailed {
            token: write.token(),
            failure: RequestFailure::Protocol(error),
        });
        assert_eq!(workflow.outcome(), Some(Err(FailureReason::Protocol(error))));
    }

    #[test]
    fn test_resolver_failure() {
        let (mut workflow, read_settings) = at_settings_read();
        let resolve = workflow
            .handle(Event::PropertyValue {
                token: read_settings.token(),
                value: model_a_settings(Ipv4Addr::new(10, 0, 0, 1)),
            })
            .unwrap();
        workflow.handle(Event::ResolverFailed {
            token: resolve.token(),
            reason: "HTTP 503".into(),
        });
        assert_eq!(
            workflow.outcome(),
            Some(Err(FailureReason::ResolverUnavailable("HTTP 503".into())))
        );
    }

    #[test]
    fn test_tokens_increase() {
        let (_, read_settings) = at_settings_read();
        assert_eq!(read_settings.token(), RequestToken(4));
    }
}
