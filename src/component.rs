//! Interface identities and component references.
//!
//! The marshalling core never inspects user payloads; it only needs a way
//! to name an interface role and to hold a shared reference to a component
//! implementing it. Generated codecs recover the concrete type behind a
//! reference through `downcast-rs`.

use downcast_rs::{impl_downcast, DowncastSync};
use std::fmt;
use std::sync::Arc;

/// Identity of an interface role.
///
/// The core does not prescribe an identity scheme; embedders assign their
/// own values. The range below `0x100` is reserved for the interfaces the
/// crate itself marshals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u64);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The universal root interface: every component can answer which further
/// interface roles it exposes.
pub const OBJECT_ACCESS_INTERFACE: InterfaceId = InterfaceId(0x01);

/// The channel-request interface exposed by a connection listener.
pub const REQUEST_CHANNEL_INTERFACE: InterfaceId = InterfaceId(0x02);

/// Base trait for every object that can travel across a channel.
///
/// `get_interface` resolves another role on the same component; the default
/// answers none. Server objects override it to hand out the interfaces a
/// remote peer may request, proxy clients override it to forward the query
/// across the wire.
pub trait ComponentInterface: DowncastSync {
    fn get_interface(&self, id: InterfaceId) -> Option<InterfaceRef> {
        let _ = id;
        None
    }
}
impl_downcast!(sync ComponentInterface);

/// A reference to a component in a particular interface role.
#[derive(Clone)]
pub struct InterfaceRef {
    id: InterfaceId,
    object: Arc<dyn ComponentInterface>,
}

impl InterfaceRef {
    pub fn new(id: InterfaceId, object: Arc<dyn ComponentInterface>) -> InterfaceRef {
        InterfaceRef { id, object }
    }

    /// The interface role this reference was taken in.
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// The referenced component.
    pub fn object(&self) -> &Arc<dyn ComponentInterface> {
        &self.object
    }

    /// Resolve another interface role on the referenced component.
    pub fn get_interface(&self, id: InterfaceId) -> Option<InterfaceRef> {
        self.object.get_interface(id)
    }

    /// Recover the concrete component type.
    pub fn downcast<T: ComponentInterface>(&self) -> Option<Arc<T>> {
        self.object.clone().downcast_arc::<T>().ok()
    }

    /// Pointer-identity key; two references to the same component in the
    /// same role compare equal.
    pub(crate) fn key(&self) -> (usize, InterfaceId) {
        (Arc::as_ptr(&self.object) as *const () as usize, self.id)
    }
}

impl fmt::Debug for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRef")
            .field("id", &self.id)
            .field("object", &(Arc::as_ptr(&self.object) as *const ()))
            .finish()
    }
}
