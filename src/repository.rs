//! Creator interfaces for raw proxy and stub objects.
//!
//! The component repository is an external collaborator: the control only
//! consumes its ability to produce a "raw" proxy or stub object for an
//! interface identity. Generated codecs implement [`ProxyObject`] and
//! [`StubObject`]; [`CodecRegistry`] is a straightforward repository
//! implementation backed by factory closures, pre-seeded with the codecs
//! the crate marshals itself.

use crate::access::{ObjectAccessProxy, ObjectAccessStub};
use crate::component::{InterfaceId, InterfaceRef, OBJECT_ACCESS_INTERFACE, REQUEST_CHANNEL_INTERFACE};
use crate::connect::listener::{ChannelBroker, RequestChannelProxy, RequestChannelStub};
use crate::error::ComResult;
use crate::marshall::{CallForwarder, MarshallAccess};
use crate::wire::{FrameSeq, MarshallId};
use std::collections::HashMap;

/// Everything a generated proxy needs to forward encoded calls.
pub struct ProxyLink {
    /// Identity stamped on the proxy.
    pub ident: MarshallId,
    /// Forwarding handle into the marshalling core.
    pub forwarder: CallForwarder,
    /// Access for marshalling interface-valued arguments.
    pub access: MarshallAccess,
}

/// Everything a generated stub needs to dispatch decoded calls.
pub struct StubLink {
    /// Identity stamped on the stub.
    pub ident: MarshallId,
    /// The local component the stub invokes.
    pub target: InterfaceRef,
    /// Access for marshalling interface-valued arguments.
    pub access: MarshallAccess,
}

/// A raw proxy object produced by the repository.
pub trait ProxyObject: Send + Sync {
    /// Connect the proxy to the marshalling core. User calls against the
    /// target interface are funnelled through the supplied forwarder.
    fn link(&self, link: ProxyLink);

    /// The interface the user calls through. Available after linking.
    fn target_interface(&self) -> Option<InterfaceRef>;
}

/// A raw stub object produced by the repository.
pub trait StubObject: Send + Sync {
    /// Bind the stub to a local component. Returns whether the component
    /// matched the interface the stub was generated for.
    fn link(&self, link: StubLink) -> bool;

    /// Decode an incoming payload, invoke the local component, and encode
    /// the result.
    fn dispatch(&self, frames: FrameSeq) -> ComResult<FrameSeq>;
}

/// Creator for raw proxy/stub objects, resolved by interface identity.
pub trait MarshallRepository: Send + Sync {
    fn create_proxy_object(&self, id: InterfaceId) -> Option<Box<dyn ProxyObject>>;
    fn create_stub_object(&self, id: InterfaceId) -> Option<Box<dyn StubObject>>;
}

type ProxyFactory = Box<dyn Fn() -> Box<dyn ProxyObject> + Send + Sync>;
type StubFactory = Box<dyn Fn() -> Box<dyn StubObject> + Send + Sync>;

/// Factory-closure repository.
///
/// Created pre-seeded with the object-access and channel-request codecs;
/// embedders add one proxy and one stub factory per generated interface.
pub struct CodecRegistry {
    proxies: HashMap<InterfaceId, ProxyFactory>,
    stubs: HashMap<InterfaceId, StubFactory>,
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        let mut registry = CodecRegistry {
            proxies: HashMap::new(),
            stubs: HashMap::new(),
        };
        registry.register_proxy(OBJECT_ACCESS_INTERFACE, || {
            Box::new(ObjectAccessProxy::new())
        });
        registry.register_stub(OBJECT_ACCESS_INTERFACE, || {
            Box::new(ObjectAccessStub::new())
        });
        registry.register_proxy(REQUEST_CHANNEL_INTERFACE, || {
            Box::new(RequestChannelProxy::new())
        });
        registry.register_stub(REQUEST_CHANNEL_INTERFACE, || {
            Box::new(RequestChannelStub::<ChannelBroker>::new())
        });
        registry
    }

    /// Register the proxy factory for an interface identity.
    pub fn register_proxy<F>(&mut self, id: InterfaceId, factory: F)
    where
        F: Fn() -> Box<dyn ProxyObject> + Send + Sync + 'static,
    {
        self.proxies.insert(id, Box::new(factory));
    }

    /// Register the stub factory for an interface identity.
    pub fn register_stub<F>(&mut self, id: InterfaceId, factory: F)
    where
        F: Fn() -> Box<dyn StubObject> + Send + Sync + 'static,
    {
        self.stubs.insert(id, Box::new(factory));
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MarshallRepository for CodecRegistry {
    fn create_proxy_object(&self, id: InterfaceId) -> Option<Box<dyn ProxyObject>> {
        self.proxies.get(&id).map(|factory| factory())
    }

    fn create_stub_object(&self, id: InterfaceId) -> Option<Box<dyn StubObject>> {
        self.stubs.get(&id).map(|factory| factory())
    }
}
