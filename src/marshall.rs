//! Marshall objects: the per-proxy and per-stub dispatch points.
//!
//! A marshall object is a tagged variant. The proxy variant forwards an
//! encoded call across its connector; the stub variant hands the call to
//! the raw stub object, which decodes the payload and invokes the local
//! component. Both expose the single `call` operation.

use crate::component::{InterfaceId, InterfaceRef};
use crate::connector::ChannelConnector;
use crate::control::CommunicationControl;
use crate::error::{ComError, ComResult};
use crate::repository::{ProxyObject, StubObject};
use crate::wire::{FrameSeq, MarshallId};
use std::sync::{Arc, Weak};

enum MarshallVariant {
    Proxy {
        /// Identity of the remote stub this proxy talks to. Empty means the
        /// initial object on the far end of the channel.
        stub_id: MarshallId,
        connector: Weak<ChannelConnector>,
        object: Arc<dyn ProxyObject>,
    },
    Stub {
        #[allow(dead_code)]
        target: InterfaceRef,
        object: Arc<dyn StubObject>,
    },
}

/// A proxy or stub dispatch point with a stable identity.
pub struct MarshallObject {
    id: MarshallId,
    variant: MarshallVariant,
}

impl MarshallObject {
    pub(crate) fn new_proxy(
        id: MarshallId,
        stub_id: MarshallId,
        connector: Weak<ChannelConnector>,
        object: Arc<dyn ProxyObject>,
    ) -> MarshallObject {
        MarshallObject {
            id,
            variant: MarshallVariant::Proxy {
                stub_id,
                connector,
                object,
            },
        }
    }

    pub(crate) fn new_stub(
        id: MarshallId,
        target: InterfaceRef,
        object: Arc<dyn StubObject>,
    ) -> MarshallObject {
        MarshallObject {
            id,
            variant: MarshallVariant::Stub { target, object },
        }
    }

    /// Identity of this marshall object.
    pub fn marshall_id(&self) -> MarshallId {
        self.id
    }

    /// The interface a user calls through. Only proxies carry one.
    pub fn proxy_interface(&self) -> Option<InterfaceRef> {
        match &self.variant {
            MarshallVariant::Proxy { object, .. } => object.target_interface(),
            MarshallVariant::Stub { .. } => None,
        }
    }

    /// Dispatch an encoded call.
    ///
    /// Proxies forward across their connector and block until the response
    /// or cancellation arrives; stubs decode and invoke the local component
    /// synchronously.
    pub fn call(&self, frames: FrameSeq) -> ComResult<FrameSeq> {
        match &self.variant {
            MarshallVariant::Proxy {
                stub_id, connector, ..
            } => {
                let connector = connector.upgrade().ok_or(ComError::NotInitialized)?;
                connector.make_call(self.id, *stub_id, frames)
            }
            MarshallVariant::Stub { object, .. } => object.dispatch(frames),
        }
    }
}

/// Forwarding handle handed to generated proxy codecs.
///
/// Holds a weak reference so a cached codec object cannot keep its marshall
/// object alive after the connection released it.
#[derive(Clone)]
pub struct CallForwarder {
    marshall: Weak<MarshallObject>,
}

impl CallForwarder {
    pub(crate) fn new(marshall: Weak<MarshallObject>) -> CallForwarder {
        CallForwarder { marshall }
    }

    /// Forward an encoded call through the marshall object.
    pub fn call(&self, frames: FrameSeq) -> ComResult<FrameSeq> {
        let marshall = self.marshall.upgrade().ok_or(ComError::NotInitialized)?;
        marshall.call(frames)
    }
}

/// Marshalling access for interface-valued arguments inside payloads.
///
/// Codecs encode a local interface as its stub identity and decode a stub
/// identity back into a proxy. Proxy resolution runs against the connector
/// currently dispatching on this thread, which routes the interface over
/// the same transport the payload arrived on.
#[derive(Clone)]
pub struct MarshallAccess {
    control: Weak<CommunicationControl>,
}

impl MarshallAccess {
    pub(crate) fn new(control: Weak<CommunicationControl>) -> MarshallAccess {
        MarshallAccess { control }
    }

    /// Encode: resolve (or create) the stub identity for a local interface.
    pub fn stub_for(&self, interface: &InterfaceRef) -> Option<MarshallId> {
        self.control.upgrade()?.get_stub(interface)
    }

    /// Decode: resolve a stub identity into a proxy interface over the
    /// current connector.
    pub fn proxy_for(&self, stub_id: MarshallId, id: InterfaceId) -> Option<InterfaceRef> {
        self.control.upgrade()?.get_proxy(stub_id, id)
    }
}
