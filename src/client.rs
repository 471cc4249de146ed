//! BACnet/IP Client
//!
//! An async client for the handful of services the correction tool needs.
//! [`ProtocolStack`] is the seam the workflow session drives; [`BacnetIpClient`]
//! implements it over a tokio UDP socket.
//!
//! Only one confirmed exchange runs at a time. Replies are matched on invoke
//! id and source address, so late answers to an abandoned request are dropped
//! instead of being mistaken for the current one.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::app::{Apdu, ApplicationError, InvokeIdGenerator, MaxApduSize};
use crate::encoding::EncodingError;
use crate::network::{NetworkError, Npdu};
use crate::object::{ObjectIdentifier, ObjectType};
use crate::service::{
    ConfirmedServiceChoice, IAmRequest, ProtocolError, ReadPropertyAck, ReadPropertyRequest,
    ReinitializeDeviceRequest, ServiceError, UnconfirmedServiceChoice, WhoIsRequest,
    WritePropertyRequest,
};
use crate::transport::{
    bind_udp_socket, constants, local_broadcast_addresses, BacnetIpConfig, BvllFunction,
    BvllMessage, ForeignDevice, TimeoutConfig, TransportError,
};
use crate::util::hex_dump;

/// Errors returned by a [`ProtocolStack`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("network layer error: {0}")]
    Network(#[from] NetworkError),
    #[error("application layer error: {0}")]
    Application(#[from] ApplicationError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    #[error("no response from {0} within {1:?}")]
    Timeout(SocketAddr, Duration),
    #[error("device replied with {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("segmented responses are not supported")]
    SegmentationUnsupported,
}

impl ClientError {
    /// Failures worth another attempt: nothing came back, or the socket failed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Timeout(..) | ClientError::Transport(_))
    }
}

/// A device that answered Who-Is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: SocketAddr,
    pub device_id: u32,
    pub vendor_id: u32,
    pub max_apdu: u32,
}

/// The protocol operations the correction workflow depends on
#[async_trait]
pub trait ProtocolStack: Send + Sync {
    /// Send Who-Is (unicast when `destination` is given, broadcast otherwise)
    /// and collect I-Am replies for `wait`
    async fn who_is(
        &self,
        destination: Option<SocketAddr>,
        range: Option<(u32, u32)>,
        wait: Duration,
    ) -> Result<Vec<DiscoveredDevice>, ClientError>;

    async fn read_property(
        &self,
        address: SocketAddr,
        request: &ReadPropertyRequest,
    ) -> Result<ReadPropertyAck, ClientError>;

    async fn write_property(
        &self,
        address: SocketAddr,
        request: &WritePropertyRequest,
    ) -> Result<(), ClientError>;

    async fn reinitialize_device(
        &self,
        address: SocketAddr,
        request: &ReinitializeDeviceRequest,
    ) -> Result<(), ClientError>;
}

/// BACnet/IP client over a single UDP socket
pub struct BacnetIpClient {
    socket: UdpSocket,
    config: BacnetIpConfig,
    timeouts: TimeoutConfig,
    // Held for the whole exchange so two requests never share the socket
    invoke_ids: Mutex<InvokeIdGenerator>,
}

impl BacnetIpClient {
    /// Bind the socket and, when configured, register as a foreign device
    pub async fn bind(config: BacnetIpConfig, timeouts: TimeoutConfig) -> Result<Self, ClientError> {
        let socket = bind_udp_socket(config.bind_address)?;
        let client = Self {
            socket,
            config,
            timeouts,
            invoke_ids: Mutex::new(InvokeIdGenerator::new()),
        };
        if let Some(foreign_device) = client.config.foreign_device {
            client.register_foreign_device(foreign_device).await?;
        }
        Ok(client)
    }

    /// Who-Is that collects I-Am replies for the configured discovery timeout
    pub async fn discover(
        &self,
        destination: Option<SocketAddr>,
        range: Option<(u32, u32)>,
    ) -> Result<Vec<DiscoveredDevice>, ClientError> {
        self.who_is(destination, range, self.timeouts.discovery_timeout)
            .await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr().map_err(TransportError::from)?)
    }

    /// Register with a BBMD so its broadcasts reach us and ours reach its network
    pub async fn register_foreign_device(&self, foreign_device: ForeignDevice) -> Result<(), ClientError> {
        let _guard = self.invoke_ids.lock().await;
        log::info!(
            "registering as foreign device with {} (ttl {}s)",
            foreign_device.bbmd,
            foreign_device.ttl
        );
        let message = BvllMessage::register_foreign_device(foreign_device.ttl);
        self.send_raw(&message.encode(), foreign_device.bbmd).await?;

        let deadline = Instant::now() + self.timeouts.registration_timeout;
        loop {
            let Some((source, message)) = self.receive_bvll(deadline).await? else {
                return Err(ClientError::Timeout(
                    foreign_device.bbmd,
                    self.timeouts.registration_timeout,
                ));
            };
            if source != foreign_device.bbmd {
                continue;
            }
            match message.result_code() {
                Some(constants::BVLC_RESULT_SUCCESSFUL) => {
                    log::debug!("foreign device registration accepted");
                    return Ok(());
                }
                Some(code) => return Err(TransportError::RegistrationFailed(code).into()),
                None => continue,
            }
        }
    }

    async fn send_raw(&self, frame: &[u8], destination: SocketAddr) -> Result<(), ClientError> {
        log::trace!("-> {} {}", destination, hex_dump(frame));
        self.socket
            .send_to(frame, destination)
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }

    async fn send_npdu(
        &self,
        function: BvllFunction,
        payload: Vec<u8>,
        destination: SocketAddr,
    ) -> Result<(), ClientError> {
        let message = BvllMessage::new(function, payload);
        self.send_raw(&message.encode(), destination).await
    }

    /// Next well-formed BVLL frame, or None once `deadline` passes
    async fn receive_bvll(
        &self,
        deadline: Instant,
    ) -> Result<Option<(SocketAddr, BvllMessage)>, ClientError> {
        let mut buffer = vec![0u8; self.config.buffer_size];
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buffer)).await;
            let (length, source) = match received {
                Err(_elapsed) => return Ok(None),
                Ok(result) => result.map_err(TransportError::from)?,
            };
            let frame = &buffer[..length];
            log::trace!("<- {} {}", source, hex_dump(frame));
            match BvllMessage::decode(frame) {
                Ok(message) => {
                    let source = message.forwarded_from().unwrap_or(source);
                    return Ok(Some((source, message)));
                }
                Err(e) => log::debug!("dropping frame from {}: {}", source, e),
            }
        }
    }

    /// Next APDU, or None once `deadline` passes
    async fn receive_apdu(&self, deadline: Instant) -> Result<Option<(SocketAddr, Apdu)>, ClientError> {
        while let Some((source, message)) = self.receive_bvll(deadline).await? {
            let Some(npdu) = message.npdu() else {
                continue;
            };
            let apdu = Npdu::decode(npdu)
                .map_err(ClientError::from)
                .and_then(|(_, consumed)| Ok(Apdu::decode(&npdu[consumed..])?));
            match apdu {
                Ok(apdu) => return Ok(Some((source, apdu))),
                Err(e) => log::debug!("dropping message from {}: {}", source, e),
            }
        }
        Ok(None)
    }

    /// Where broadcasts go: through the BBMD when registered, otherwise the
    /// configured or discovered subnet broadcast addresses
    fn broadcast_targets(&self) -> Vec<(BvllFunction, SocketAddr)> {
        if let Some(foreign_device) = self.config.foreign_device {
            return vec![(BvllFunction::DistributeBroadcastToNetwork, foreign_device.bbmd)];
        }
        let addresses = if self.config.broadcast_addresses.is_empty() {
            local_broadcast_addresses(constants::BACNET_IP_PORT)
        } else {
            self.config.broadcast_addresses.clone()
        };
        addresses
            .into_iter()
            .map(|address| (BvllFunction::OriginalBroadcastNpdu, address))
            .collect()
    }

    /// Run one confirmed exchange and return the acknowledging APDU
    async fn confirmed_request(
        &self,
        address: SocketAddr,
        service_choice: ConfirmedServiceChoice,
        service_data: Vec<u8>,
    ) -> Result<Apdu, ClientError> {
        let mut invoke_ids = self.invoke_ids.lock().await;
        let invoke_id = invoke_ids.next_id();

        let apdu = Apdu::ConfirmedRequest {
            segmented_response_accepted: false,
            max_response_size: MaxApduSize::Up1476,
            invoke_id,
            service_choice,
            service_data,
        };
        let mut payload = Npdu::confirmed().encode();
        payload.extend_from_slice(&apdu.encode());
        log::debug!("{:?} #{} -> {}", service_choice, invoke_id, address);
        self.send_npdu(BvllFunction::OriginalUnicastNpdu, payload, address)
            .await?;

        let deadline = Instant::now() + self.timeouts.request_timeout;
        while let Some((source, reply)) = self.receive_apdu(deadline).await? {
            if source != address || reply.invoke_id() != Some(invoke_id) {
                log::debug!("ignoring {:?} from {}", reply.invoke_id(), source);
                continue;
            }
            return match reply {
                Apdu::SimpleAck { .. } => Ok(reply),
                Apdu::ComplexAck { segmented: true, .. } => Err(ClientError::SegmentationUnsupported),
                Apdu::ComplexAck { .. } => Ok(reply),
                Apdu::Error {
                    error_class,
                    error_code,
                    ..
                } => Err(ProtocolError::Error {
                    class: error_class,
                    code: error_code,
                }
                .into()),
                Apdu::Reject { reject_reason, .. } => Err(ProtocolError::Reject(reject_reason).into()),
                Apdu::Abort { abort_reason, .. } => Err(ProtocolError::Abort(abort_reason).into()),
                other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
            };
        }
        Err(ClientError::Timeout(address, self.timeouts.request_timeout))
    }
}

fn expect_simple_ack(reply: Apdu) -> Result<(), ClientError> {
    match reply {
        Apdu::SimpleAck { .. } => Ok(()),
        other => Err(ClientError::UnexpectedResponse(format!(
            "expected SimpleAck, got {:?}",
            other
        ))),
    }
}

#[async_trait]
impl ProtocolStack for BacnetIpClient {
    async fn who_is(
        &self,
        destination: Option<SocketAddr>,
        range: Option<(u32, u32)>,
        wait: Duration,
    ) -> Result<Vec<DiscoveredDevice>, ClientError> {
        let _guard = self.invoke_ids.lock().await;
        let request = match range {
            Some((low, high)) => WhoIsRequest::for_range(low, high),
            None => WhoIsRequest::new(),
        };
        let mut service_data = Vec::new();
        request.encode(&mut service_data)?;
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::WhoIs,
            service_data,
        };

        let targets = match destination {
            Some(address) => vec![(BvllFunction::OriginalUnicastNpdu, address)],
            None => self.broadcast_targets(),
        };
        for (function, address) in targets {
            let mut payload = Npdu::new().encode();
            payload.extend_from_slice(&apdu.encode());
            log::debug!("Who-Is {:?} -> {}", range, address);
            self.send_npdu(function, payload, address).await?;
        }

        let mut devices: Vec<DiscoveredDevice> = Vec::new();
        let deadline = Instant::now() + wait;
        while let Some((source, reply)) = self.receive_apdu(deadline).await? {
            let Apdu::UnconfirmedRequest {
                service_choice: UnconfirmedServiceChoice::IAm,
                service_data,
            } = reply
            else {
                continue;
            };
            let i_am = match IAmRequest::decode(&service_data) {
                Ok(i_am) => i_am,
                Err(e) => {
                    log::debug!("bad I-Am from {}: {}", source, e);
                    continue;
                }
            };
            let device_id = i_am.device_identifier.instance;
            if !request.matches(device_id) || devices.iter().any(|d| d.device_id == device_id) {
                continue;
            }
            log::debug!("I-Am {} from {}", i_am.device_identifier, source);
            devices.push(DiscoveredDevice {
                address: source,
                device_id,
                vendor_id: i_am.vendor_identifier,
                max_apdu: i_am.max_apdu_length_accepted,
            });
            if destination == Some(source) {
                break;
            }
        }
        Ok(devices)
    }

    async fn read_property(
        &self,
        address: SocketAddr,
        request: &ReadPropertyRequest,
    ) -> Result<ReadPropertyAck, ClientError> {
        let mut service_data = Vec::new();
        request.encode(&mut service_data)?;
        let reply = self
            .confirmed_request(address, ConfirmedServiceChoice::ReadProperty, service_data)
            .await?;
        let Apdu::ComplexAck { service_data, .. } = reply else {
            return Err(ClientError::UnexpectedResponse(format!(
                "expected ReadProperty-ACK, got {:?}",
                reply
            )));
        };
        let ack = ReadPropertyAck::decode(&service_data)?;
        if !ack.answers(request) {
            return Err(ClientError::UnexpectedResponse(format!(
                "ReadProperty-ACK for {} property {}",
                ack.object_identifier, ack.property_identifier
            )));
        }
        Ok(ack)
    }

    async fn write_property(
        &self,
        address: SocketAddr,
        request: &WritePropertyRequest,
    ) -> Result<(), ClientError> {
        let mut service_data = Vec::new();
        request.encode(&mut service_data)?;
        let reply = self
            .confirmed_request(address, ConfirmedServiceChoice::WriteProperty, service_data)
            .await?;
        expect_simple_ack(reply)
    }

    async fn reinitialize_device(
        &self,
        address: SocketAddr,
        request: &ReinitializeDeviceRequest,
    ) -> Result<(), ClientError> {
        let mut service_data = Vec::new();
        request.encode(&mut service_data)?;
        let reply = self
            .confirmed_request(address, ConfirmedServiceChoice::ReinitializeDevice, service_data)
            .await?;
        expect_simple_ack(reply)
    }
}

/// Device object for an instance number
pub fn device_object(instance: u32) -> ObjectIdentifier {
    ObjectIdentifier::new(ObjectType::Device, instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{ApplicationTag, Tag, TagList};
    use crate::object::PropertyIdentifier;
    use crate::service::{ErrorClass, ErrorCode};

    /// A scripted device on the loopback interface
    struct FakeDevice {
        socket: UdpSocket,
    }

    impl FakeDevice {
        async fn start() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn address(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn receive(&self) -> (SocketAddr, Apdu) {
            let mut buffer = [0u8; 1500];
            let (length, source) = self.socket.recv_from(&mut buffer).await.unwrap();
            let message = BvllMessage::decode(&buffer[..length]).unwrap();
            let npdu = message.npdu().unwrap();
            let (_, consumed) = Npdu::decode(npdu).unwrap();
            (source, Apdu::decode(&npdu[consumed..]).unwrap())
        }

        async fn reply(&self, to: SocketAddr, apdu: Apdu) {
            let mut payload = Npdu::new().encode();
            payload.extend_from_slice(&apdu.encode());
            let frame = BvllMessage::new(BvllFunction::OriginalUnicastNpdu, payload).encode();
            self.socket.send_to(&frame, to).await.unwrap();
        }
    }

    async fn client() -> BacnetIpClient {
        let config = BacnetIpConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..BacnetIpConfig::default()
        };
        let timeouts = TimeoutConfig {
            request_timeout: Duration::from_millis(300),
            discovery_timeout: Duration::from_millis(200),
            ..TimeoutConfig::default()
        };
        BacnetIpClient::bind(config, timeouts).await.unwrap()
    }

    fn model_name_request() -> ReadPropertyRequest {
        ReadPropertyRequest::new(device_object(1200), PropertyIdentifier::ModelName)
    }

    #[tokio::test]
    async fn test_read_property_round_trip() {
        let device = FakeDevice::start().await;
        let client = client().await;
        let address = device.address();

        let responder = tokio::spawn(async move {
            let (source, request) = device.receive().await;
            let Apdu::ConfirmedRequest { invoke_id, .. } = request else {
                panic!("expected confirmed request, got {:?}", request);
            };
            // A stale answer with the wrong invoke id must be ignored
            device
                .reply(source, Apdu::SimpleAck {
                    invoke_id: invoke_id.wrapping_add(1),
                    service_choice: 12,
                })
                .await;
            let ack = ReadPropertyAck {
                object_identifier: device_object(1200),
                property_identifier: PropertyIdentifier::ModelName,
                array_index: None,
                value: TagList::from(vec![Tag::application(
                    ApplicationTag::CharacterString,
                    b"\x00DSC-1616".to_vec(),
                )]),
            };
            let mut service_data = Vec::new();
            ack.encode(&mut service_data).unwrap();
            device
                .reply(source, Apdu::ComplexAck {
                    segmented: false,
                    invoke_id,
                    service_choice: 12,
                    service_data,
                })
                .await;
        });

        let ack = client.read_property(address, &model_name_request()).await.unwrap();
        assert_eq!(ack.value.len(), 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_pdu_maps_to_protocol_error() {
        let device = FakeDevice::start().await;
        let client = client().await;
        let address = device.address();

        tokio::spawn(async move {
            let (source, request) = device.receive().await;
            let invoke_id = request.invoke_id().unwrap();
            device
                .reply(source, Apdu::Error {
                    invoke_id,
                    service_choice: 15,
                    error_class: ErrorClass::Property,
                    error_code: ErrorCode::WriteAccessDenied,
                })
                .await;
        });

        let request = WritePropertyRequest::new(
            ObjectIdentifier::new(ObjectType::Proprietary(278), 1),
            PropertyIdentifier::Proprietary(1101),
            TagList::new(),
        );
        let error = client.write_property(address, &request).await.unwrap_err();
        assert!(matches!(
            error,
            ClientError::Protocol(ProtocolError::Error {
                class: ErrorClass::Property,
                code: ErrorCode::WriteAccessDenied
            })
        ));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_no_reply_times_out() {
        let device = FakeDevice::start().await;
        let client = client().await;
        let error = client
            .read_property(device.address(), &model_name_request())
            .await
            .unwrap_err();
        assert!(matches!(error, ClientError::Timeout(..)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_unicast_who_is() {
        let device = FakeDevice::start().await;
        let client = client().await;
        let address = device.address();

        tokio::spawn(async move {
            let (source, request) = device.receive().await;
            assert!(matches!(
                request,
                Apdu::UnconfirmedRequest {
                    service_choice: UnconfirmedServiceChoice::WhoIs,
                    ..
                }
            ));
            for instance in [77, 1200] {
                let mut service_data = Vec::new();
                IAmRequest {
                    device_identifier: device_object(instance),
                    max_apdu_length_accepted: 480,
                    segmentation_supported: 3,
                    vendor_identifier: 8,
                }
                .encode(&mut service_data)
                .unwrap();
                device
                    .reply(source, Apdu::UnconfirmedRequest {
                        service_choice: UnconfirmedServiceChoice::IAm,
                        service_data,
                    })
                    .await;
            }
        });

        let devices = client
            .who_is(Some(address), Some((1200, 1200)), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, 1200);
        assert_eq!(devices[0].address, address);
        assert_eq!(devices[0].max_apdu, 480);
    }

    #[tokio::test]
    async fn test_discover_waits_for_discovery_timeout() {
        let device = FakeDevice::start().await;
        let client = client().await;
        let started = std::time::Instant::now();
        let devices = tokio::time::timeout(
            Duration::from_secs(2),
            client.discover(Some(device.address()), None),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(devices.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
