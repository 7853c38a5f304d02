//! Listener side of the connection broker.
//!
//! The listener serves a long-lived channel with the reconnect flag set;
//! its initial object is the channel broker. A client connects, asks the
//! broker for a private channel, and moves over. The private channel is
//! created on the same transport family, assigned with a short timeout
//! and without reconnect, and serves the listener's root object.

use crate::component::{
    ComponentInterface, InterfaceId, InterfaceRef, OBJECT_ACCESS_INTERFACE,
    REQUEST_CHANNEL_INTERFACE,
};
use crate::config;
use crate::control::{CommunicationControl, ObjectStatus, OperationMode};
use crate::defaults::PRIVATE_CHANNEL_TIMEOUT;
use crate::error::{ComError, ComResult};
use crate::repository::{ProxyLink, ProxyObject, StubLink, StubObject};
use crate::transport::ChannelKind;
use crate::wire::{ConnectionId, FrameSeq};
use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

const OP_REQUEST_CHANNEL: u8 = 0;

/// The single operation a connection listener exposes.
pub trait RequestChannel: Send + Sync {
    /// Create a fresh private channel and return its connection string.
    fn request_channel(&self, config: &str) -> ComResult<String>;
}

/// Service object bound to the listener channel.
pub struct ChannelBroker {
    control: Weak<CommunicationControl>,
    provider: String,
    root: InterfaceRef,
    self_weak: Weak<ChannelBroker>,
}

impl ChannelBroker {
    pub(crate) fn new(
        control: Weak<CommunicationControl>,
        provider: String,
        root: InterfaceRef,
    ) -> Arc<ChannelBroker> {
        Arc::new_cyclic(|self_weak| ChannelBroker {
            control,
            provider,
            root,
            self_weak: self_weak.clone(),
        })
    }
}

impl ComponentInterface for ChannelBroker {
    fn get_interface(&self, id: InterfaceId) -> Option<InterfaceRef> {
        if id == REQUEST_CHANNEL_INTERFACE {
            let broker = self.self_weak.upgrade()?;
            Some(InterfaceRef::new(REQUEST_CHANNEL_INTERFACE, broker))
        } else {
            None
        }
    }
}

impl RequestChannel for ChannelBroker {
    fn request_channel(&self, _config: &str) -> ComResult<String> {
        let control = self.control.upgrade().ok_or(ComError::NotInitialized)?;
        let provider = control.transport(&self.provider).ok_or_else(|| {
            ComError::Marshalling(format!("no transport provider named {:?}", self.provider))
        })?;
        let handle = provider.create_endpoint("").map_err(|error| {
            ComError::Marshalling(format!("could not create the channel endpoint: {error}"))
        })?;
        control
            .assign_server_endpoint(
                handle.endpoint,
                self.root.clone(),
                PRIVATE_CHANNEL_TIMEOUT,
                false,
            )
            .map_err(|error| {
                ComError::Marshalling(format!("could not assign the server endpoint: {error}"))
            })?;
        info!("client connection established");
        Ok(handle.connect_string)
    }
}

/// Connection listener service.
pub struct Listener {
    control: Arc<CommunicationControl>,
    #[allow(dead_code)]
    broker: Arc<ChannelBroker>,
    connection: Mutex<Option<ConnectionId>>,
    local: bool,
    status: AtomicCell<ObjectStatus>,
}

impl Listener {
    /// Parse the `[Listener]` configuration, create the listening endpoint
    /// on the selected transport family, and serve the broker over it.
    /// `root` is the object every private channel will expose.
    pub fn initialize(
        control: &Arc<CommunicationControl>,
        config: &str,
        root: InterfaceRef,
    ) -> Result<Listener> {
        let settings = config::parse_listener(config)?;
        let (kind, endpoint_config, local) = match settings.kind {
            ChannelKind::Local => {
                let instance = settings.instance.unwrap_or_else(config::default_instance);
                (
                    ChannelKind::Local,
                    format!("[IpcChannel]\nName = \"LISTENER_{instance}\"\nSize = 2048\n"),
                    true,
                )
            }
            ChannelKind::Remote => {
                let interface = settings.interface.unwrap_or_default();
                let port = settings.port.unwrap_or(0);
                if interface.is_empty() || port == 0 {
                    bail!("missing interface or port number to initialize a remote listener");
                }
                (
                    ChannelKind::Remote,
                    format!("[IpcChannel]\nInterface = \"{interface}\"\nPort = {port}\n"),
                    false,
                )
            }
        };

        let provider_name = kind.provider_name();
        let provider = control
            .transport(provider_name)
            .with_context(|| format!("no transport provider named {provider_name:?}"))?;
        let handle = provider
            .create_endpoint(&endpoint_config)
            .context("could not create the endpoint for the listener")?;

        let broker = ChannelBroker::new(
            Arc::downgrade(control),
            provider_name.to_string(),
            root,
        );
        let connection = control
            .assign_server_endpoint(
                handle.endpoint,
                InterfaceRef::new(OBJECT_ACCESS_INTERFACE, broker.clone()),
                Duration::from_millis(100),
                true,
            )
            .context("could not assign the server endpoint")?;

        Ok(Listener {
            control: control.clone(),
            broker,
            connection: Mutex::new(Some(connection)),
            local,
            status: AtomicCell::new(ObjectStatus::Initialized),
        })
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection.lock()
    }

    pub fn status(&self) -> ObjectStatus {
        self.status.load()
    }

    pub fn set_operation_mode(&self, mode: OperationMode) {
        let current = self.status.load();
        match mode {
            OperationMode::Configuring => {
                if matches!(current, ObjectStatus::Running | ObjectStatus::Initialized) {
                    self.status.store(ObjectStatus::Configuring);
                }
            }
            OperationMode::Running => {
                if matches!(current, ObjectStatus::Configuring | ObjectStatus::Initialized) {
                    self.status.store(ObjectStatus::Running);
                }
            }
        }
    }

    /// Stop listening and release the well-known channel.
    pub fn shutdown(&self) {
        self.status.store(ObjectStatus::ShutdownInProgress);
        if let Some(connection) = self.connection.lock().take() {
            self.control.remove_connection(connection);
        }
        self.status.store(ObjectStatus::DestructionPending);
    }
}

/// Raw proxy object for the channel-request interface.
pub struct RequestChannelProxy {
    client: Arc<RequestChannelClient>,
}

impl RequestChannelProxy {
    pub fn new() -> RequestChannelProxy {
        RequestChannelProxy {
            client: Arc::new(RequestChannelClient {
                link: Mutex::new(None),
            }),
        }
    }
}

impl Default for RequestChannelProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyObject for RequestChannelProxy {
    fn link(&self, link: ProxyLink) {
        *self.client.link.lock() = Some(link);
    }

    fn target_interface(&self) -> Option<InterfaceRef> {
        Some(InterfaceRef::new(
            REQUEST_CHANNEL_INTERFACE,
            self.client.clone(),
        ))
    }
}

/// Client-side channel-request interface; forwards across the wire.
pub struct RequestChannelClient {
    link: Mutex<Option<ProxyLink>>,
}

impl ComponentInterface for RequestChannelClient {}

impl RequestChannel for RequestChannelClient {
    fn request_channel(&self, config: &str) -> ComResult<String> {
        let forwarder = {
            let guard = self.link.lock();
            guard
                .as_ref()
                .ok_or(ComError::NotInitialized)?
                .forwarder
                .clone()
        };

        let mut request = Vec::with_capacity(5 + config.len());
        request.push(OP_REQUEST_CHANNEL);
        request
            .write_u32::<LittleEndian>(config.len() as u32)
            .map_err(|error| ComError::Marshalling(error.to_string()))?;
        request.extend_from_slice(config.as_bytes());

        let mut reply = forwarder.call(VecDeque::from(vec![request]))?;
        let payload = reply
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("channel request without reply".into()))?;
        if payload.first() != Some(&1) {
            return Err(ComError::Marshalling(
                "listener refused the channel request".into(),
            ));
        }
        if payload.len() < 5 {
            return Err(ComError::Marshalling("truncated channel reply".into()));
        }
        let length = LittleEndian::read_u32(&payload[1..5]) as usize;
        let bytes = payload
            .get(5..5 + length)
            .ok_or_else(|| ComError::Marshalling("truncated channel reply".into()))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ComError::Marshalling("channel reply is not valid utf-8".into()))
    }
}

/// Raw stub object for the channel-request interface, bound to a concrete
/// service type.
pub struct RequestChannelStub<T> {
    target: Mutex<Option<Arc<T>>>,
}

impl<T: RequestChannel + ComponentInterface> RequestChannelStub<T> {
    pub fn new() -> RequestChannelStub<T> {
        RequestChannelStub {
            target: Mutex::new(None),
        }
    }
}

impl<T: RequestChannel + ComponentInterface> Default for RequestChannelStub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RequestChannel + ComponentInterface> StubObject for RequestChannelStub<T> {
    fn link(&self, link: StubLink) -> bool {
        match link.target.downcast::<T>() {
            Some(target) => {
                *self.target.lock() = Some(target);
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, mut frames: FrameSeq) -> ComResult<FrameSeq> {
        let target = self
            .target
            .lock()
            .clone()
            .ok_or(ComError::NotInitialized)?;

        let payload = frames
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("channel request without payload".into()))?;
        if payload.len() < 5 || payload[0] != OP_REQUEST_CHANNEL {
            return Err(ComError::Marshalling(
                "malformed channel request payload".into(),
            ));
        }
        let length = LittleEndian::read_u32(&payload[1..5]) as usize;
        let config = payload
            .get(5..5 + length)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .ok_or_else(|| ComError::Marshalling("malformed channel request payload".into()))?;

        let mut reply = Vec::new();
        match target.request_channel(config) {
            Ok(connect_string) => {
                reply.push(1);
                reply
                    .write_u32::<LittleEndian>(connect_string.len() as u32)
                    .map_err(|error| ComError::Marshalling(error.to_string()))?;
                reply.extend_from_slice(connect_string.as_bytes());
            }
            Err(error) => {
                warn!("channel request failed: {error}");
                reply.push(0);
            }
        }
        Ok(VecDeque::from(vec![reply]))
    }
}
