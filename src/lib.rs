//! # SDV IPC Core
//!
//! Inter-process communication core for a component-oriented vehicle
//! software runtime: a proxy/stub marshalling layer that transparently
//! forwards interface calls across process boundaries, together with the
//! connection broker that establishes, multiplexes, and tears down the
//! underlying byte-stream channels.
//!
//! ## Architecture
//!
//! ```text
//! user code ──▶ proxy interface ──▶ marshall object ──▶ channel connector ──▶ transport
//! transport ──▶ channel connector ──▶ task scheduler ──▶ communication control
//!                                                       ──▶ marshall object ──▶ local object
//! ```
//!
//! - [`control::CommunicationControl`] owns the connection vector, the
//!   marshall-object directory, and the call-index allocator.
//! - [`connector::ChannelConnector`] serializes the wire address header,
//!   arbitrates invocation and response frames, and blocks outbound
//!   callers until their matching response arrives.
//! - [`scheduler::TaskScheduler`] is the elastic worker pool that keeps
//!   the transport's receive thread from ever blocking on user code.
//! - [`connect::Listener`] and [`connect::Client`] implement the
//!   two-phase rendezvous that hands every client its own private
//!   channel to the served root object.
//!
//! Transports, the marshall-object repository, and the payload codecs are
//! external collaborators reached through the traits in [`transport`],
//! [`repository`], and [`component`].

pub mod access;
pub mod component;
pub mod config;
pub mod connect;
pub mod connector;
pub mod control;
pub mod error;
pub mod marshall;
pub mod repository;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use component::{
    ComponentInterface, InterfaceId, InterfaceRef, OBJECT_ACCESS_INTERFACE,
    REQUEST_CHANNEL_INTERFACE,
};
pub use connect::{Client, Listener, RequestChannel};
pub use control::{CommunicationControl, ObjectStatus, OperationMode};
pub use error::{ComError, ComResult};
pub use marshall::{CallForwarder, MarshallAccess};
pub use repository::{
    CodecRegistry, MarshallRepository, ProxyLink, ProxyObject, StubLink, StubObject,
};
pub use scheduler::{ScheduleFlags, TaskScheduler};
pub use transport::{
    ChannelEndpoint, ChannelKind, ConnectStatus, DataReceive, DataSend, EndpointHandle,
    LocalTransport, TcpTransport, TransportProvider,
};
pub use wire::{Buffer, ConnectionId, FrameSeq, MarshallAddress, MarshallId};

/// The current version of the IPC core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default timeout for client connects.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default timeout granted to per-client private channels.
    pub const PRIVATE_CHANNEL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Idle level of a connector's dispatch pool.
    pub const DISPATCH_MIN_IDLE: usize = 4;

    /// Busy limit of a connector's dispatch pool.
    pub const DISPATCH_MAX_BUSY: usize = 32;
}
