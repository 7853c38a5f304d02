//! Client side of the connection broker.
//!
//! Connecting is a two-phase rendezvous: access the well-known listener
//! channel, ask the broker for a private channel, drop the listener link
//! immediately, and move over to the private channel. The proxy returned
//! by the private channel is the served root object; it stays registered
//! in the client's session map until disconnected.

use crate::component::{InterfaceRef, REQUEST_CHANNEL_INTERFACE};
use crate::config;
use crate::connect::listener::{RequestChannel, RequestChannelClient};
use crate::control::{CommunicationControl, ObjectStatus, OperationMode};
use crate::defaults::CONNECT_TIMEOUT;
use crate::transport::ChannelKind;
use crate::wire::ConnectionId;
use anyhow::{bail, Context, Result};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Rendezvous client.
pub struct Client {
    control: Arc<CommunicationControl>,
    sessions: Mutex<HashMap<ConnectionId, InterfaceRef>>,
    status: AtomicCell<ObjectStatus>,
}

impl Client {
    pub fn new(control: &Arc<CommunicationControl>) -> Client {
        Client {
            control: control.clone(),
            sessions: Mutex::new(HashMap::new()),
            status: AtomicCell::new(ObjectStatus::Initialized),
        }
    }

    /// Perform the two-phase rendezvous described by a `[Client]`
    /// configuration block. Returns the private connection identity and
    /// the proxy for the served root object.
    pub fn connect(&self, config: &str) -> Result<(ConnectionId, InterfaceRef)> {
        let settings = config::parse_client(config)?;
        let (kind, endpoint_config) = match settings.kind {
            ChannelKind::Local => {
                let instance = settings.instance.unwrap_or_else(config::default_instance);
                (
                    ChannelKind::Local,
                    format!("[IpcChannel]\nName = \"LISTENER_{instance}\"\n"),
                )
            }
            ChannelKind::Remote => {
                let interface = settings.interface.unwrap_or_default();
                let port = settings.port.unwrap_or(0);
                if interface.is_empty() || port == 0 {
                    bail!("missing interface or port number to initialize a remote client");
                }
                (
                    ChannelKind::Remote,
                    format!("[IpcChannel]\nInterface = \"{interface}\"\nPort = {port}\n"),
                )
            }
        };

        let provider_name = kind.provider_name();
        let provider = self
            .control
            .transport(provider_name)
            .with_context(|| format!("no transport provider named {provider_name:?}"))?;

        // Phase one: reach the listener and request a private channel.
        let listener_endpoint = provider
            .access(&endpoint_config)
            .context("could not access the listener channel")?;
        let (listener_connection, listener_root) = self
            .control
            .assign_client_endpoint(listener_endpoint, CONNECT_TIMEOUT)
            .context("could not assign the client endpoint")?;

        let requested = (|| -> Result<String> {
            let request_ref = listener_root
                .get_interface(REQUEST_CHANNEL_INTERFACE)
                .context("listener exposes no channel-request interface")?;
            let request = request_ref
                .downcast::<RequestChannelClient>()
                .context("unexpected channel-request proxy type")?;
            Ok(request.request_channel("")?)
        })();

        // The listener link is dropped in every case; it only exists to
        // hand out the private channel.
        self.control.remove_connection(listener_connection);
        let connect_string = requested?;
        debug!("moving to private channel");

        // Phase two: move over to the private channel.
        let private_endpoint = provider
            .access(&connect_string)
            .context("could not access the private channel")?;
        let (connection, proxy) = self
            .control
            .assign_client_endpoint(private_endpoint, CONNECT_TIMEOUT)
            .context("could not assign the client endpoint to the private channel")?;

        self.sessions.lock().insert(connection, proxy.clone());
        Ok((connection, proxy))
    }

    /// Release one session obtained through [`Client::connect`].
    pub fn disconnect(&self, connection: ConnectionId) {
        if self.sessions.lock().remove(&connection).is_some() {
            self.control.remove_connection(connection);
        }
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

    /// Release every open session.
    pub fn shutdown(&self) {
        self.status.store(ObjectStatus::ShutdownInProgress);
        let sessions: Vec<ConnectionId> = { self.sessions.lock().drain().map(|(id, _)| id).collect() };
        for connection in sessions {
            self.control.remove_connection(connection);
        }
        self.status.store(ObjectStatus::DestructionPending);
    }
}
