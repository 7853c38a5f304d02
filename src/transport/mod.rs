//! Transport capability set consumed by the marshalling core.
//!
//! The core treats a byte transport as a small object capability set: an
//! endpoint that can asynchronously connect, send movable buffer
//! sequences, deliver received sequences through a callback, and report
//! connection status transitions to registered listeners. Two providers
//! ship with the crate:
//!
//! - [`local::LocalTransport`]: in-process rendezvous through a named
//!   registry, for co-located components and tests.
//! - [`tcp::TcpTransport`]: TCP sockets with a length-prefixed frame
//!   envelope, for remote peers.
//!
//! Providers are registered with the communication control under their
//! printable name; connection strings carry `Provider.Name` so the peer
//! can pick the matching provider.

use crate::wire::FrameSeq;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod local;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// Connection status of a transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Uninitialized,
    Disconnected,
    Connected,
    DisconnectedForced,
}

/// Transport family selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChannelKind {
    Local,
    Remote,
}

impl ChannelKind {
    /// Printable name of the built-in provider serving this family.
    pub fn provider_name(&self) -> &'static str {
        match self {
            ChannelKind::Local => local::PROVIDER_NAME,
            ChannelKind::Remote => tcp::PROVIDER_NAME,
        }
    }
}

/// Outbound capability of an endpoint.
pub trait DataSend: Send + Sync {
    /// Queue a frame sequence for transmission. Returns whether the
    /// transport accepted the data.
    fn send_data(&self, frames: FrameSeq) -> bool;
}

/// Inbound callback registered through [`ChannelEndpoint::async_connect`].
/// The sequence is conveyed by move; implementations take ownership before
/// returning so the transport can reuse its buffers.
pub trait DataReceive: Send + Sync {
    fn receive_data(&self, frames: &mut FrameSeq);
}

/// Status callback invoked on every connection transition.
pub trait ConnectEvents: Send + Sync {
    fn set_status(&self, status: ConnectStatus);
}

/// A transport endpoint as seen by the marshalling core.
pub trait ChannelEndpoint: Send + Sync {
    /// The outbound capability, if the endpoint supports sending.
    fn sender(&self) -> Option<Arc<dyn DataSend>>;

    /// Start connecting asynchronously; received data is delivered through
    /// the supplied callback on a transport-owned thread.
    fn async_connect(&self, receive: Arc<dyn DataReceive>) -> bool;

    /// Block until the endpoint reports connected, or the timeout elapses.
    fn wait_for_connection(&self, timeout: Duration) -> bool;

    /// Tear the connection down. Also releases the data callback so held
    /// references drop deterministically.
    fn disconnect(&self);

    /// Register for status transitions; the returned cookie is non-zero.
    fn register_status_callback(&self, events: Arc<dyn ConnectEvents>) -> u64;

    /// Remove a previously registered status callback.
    fn unregister_status_callback(&self, cookie: u64);

    /// Current connection status.
    fn status(&self) -> ConnectStatus;
}

/// A freshly created server endpoint plus the printable string a peer uses
/// to reach it.
pub struct EndpointHandle {
    pub endpoint: Arc<dyn ChannelEndpoint>,
    pub connect_string: String,
}

/// A transport implementation able to mint server endpoints and to access
/// them from connection strings.
pub trait TransportProvider: Send + Sync {
    /// Printable provider name, embedded in connection strings.
    fn name(&self) -> &'static str;

    /// Create a server endpoint from an `[IpcChannel]` configuration block.
    fn create_endpoint(&self, config: &str) -> Result<EndpointHandle>;

    /// Access an existing server endpoint described by a connection string.
    fn access(&self, connect_string: &str) -> Result<Arc<dyn ChannelEndpoint>>;
}

/// Shared endpoint bookkeeping: status with waiters, status-callback
/// registry, and the data-callback slot.
pub(crate) struct EndpointCore {
    status: Mutex<ConnectStatus>,
    status_edge: Condvar,
    callbacks: Mutex<HashMap<u64, Arc<dyn ConnectEvents>>>,
    next_cookie: AtomicU64,
    receive: Mutex<Option<Arc<dyn DataReceive>>>,
    closed: AtomicBool,
}

impl EndpointCore {
    pub(crate) fn new() -> EndpointCore {
        EndpointCore {
            status: Mutex::new(ConnectStatus::Uninitialized),
            status_edge: Condvar::new(),
            callbacks: Mutex::new(HashMap::new()),
            next_cookie: AtomicU64::new(1),
            receive: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> ConnectStatus {
        *self.status.lock()
    }

    /// Update the status and fan the transition out to every registered
    /// listener. Listeners run outside the registry lock, so a callback may
    /// unregister itself.
    pub(crate) fn set_status(&self, status: ConnectStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
            self.status_edge.notify_all();
        }
        let listeners: Vec<Arc<dyn ConnectEvents>> =
            self.callbacks.lock().values().cloned().collect();
        for listener in listeners {
            listener.set_status(status);
        }
    }

    pub(crate) fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while *status != ConnectStatus::Connected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.status_edge.wait_for(&mut status, deadline - now);
        }
        true
    }

    pub(crate) fn register_status_callback(&self, events: Arc<dyn ConnectEvents>) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(cookie, events);
        cookie
    }

    pub(crate) fn unregister_status_callback(&self, cookie: u64) {
        self.callbacks.lock().remove(&cookie);
    }

    pub(crate) fn set_receive(&self, receive: Arc<dyn DataReceive>) {
        *self.receive.lock() = Some(receive);
    }

    pub(crate) fn receive(&self) -> Option<Arc<dyn DataReceive>> {
        self.receive.lock().clone()
    }

    pub(crate) fn clear_receive(&self) {
        *self.receive.lock() = None;
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
