//! Marshalling codec for the universal object-access interface.
//!
//! Every connection bootstraps through this interface: the client's
//! initial proxy is an object-access proxy bound to the empty sentinel
//! stub identity, and `get_interface` queries travel across the channel to
//! resolve further interface roles on the served object. The interface
//! value in the reply is carried as a stub identity and turned back into a
//! proxy over the connector the reply arrived on.

use crate::component::{ComponentInterface, InterfaceId, InterfaceRef, OBJECT_ACCESS_INTERFACE};
use crate::error::{ComError, ComResult};
use crate::repository::{ProxyLink, ProxyObject, StubLink, StubObject};
use crate::wire::{FrameSeq, MarshallId};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

const OP_GET_INTERFACE: u8 = 0;

/// Raw proxy object for the object-access interface.
pub struct ObjectAccessProxy {
    client: Arc<ObjectAccessClient>,
}

impl ObjectAccessProxy {
    pub fn new() -> ObjectAccessProxy {
        ObjectAccessProxy {
            client: Arc::new(ObjectAccessClient {
                link: Mutex::new(None),
            }),
        }
    }
}

impl Default for ObjectAccessProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyObject for ObjectAccessProxy {
    fn link(&self, link: ProxyLink) {
        *self.client.link.lock() = Some(link);
    }

    fn target_interface(&self) -> Option<InterfaceRef> {
        Some(InterfaceRef::new(
            OBJECT_ACCESS_INTERFACE,
            self.client.clone(),
        ))
    }
}

/// The interface the user calls through; forwards every query across the
/// channel.
pub struct ObjectAccessClient {
    link: Mutex<Option<ProxyLink>>,
}

impl ComponentInterface for ObjectAccessClient {
    fn get_interface(&self, id: InterfaceId) -> Option<InterfaceRef> {
        let (forwarder, access) = {
            let guard = self.link.lock();
            let link = guard.as_ref()?;
            (link.forwarder.clone(), link.access.clone())
        };

        let mut request = Vec::with_capacity(9);
        request.push(OP_GET_INTERFACE);
        request.write_u64::<LittleEndian>(id.0).ok()?;

        let mut reply = match forwarder.call(VecDeque::from(vec![request])) {
            Ok(reply) => reply,
            Err(error) => {
                debug!("object-access query for interface {id} failed: {error}");
                return None;
            }
        };
        let payload = reply.pop_front()?;
        if payload.first() != Some(&1) {
            return None;
        }
        let stub_id = MarshallId::from_le_bytes(&payload[1..])?;
        access.proxy_for(stub_id, id)
    }
}

/// Raw stub object for the object-access interface.
pub struct ObjectAccessStub {
    link: Mutex<Option<StubLink>>,
}

impl ObjectAccessStub {
    pub fn new() -> ObjectAccessStub {
        ObjectAccessStub {
            link: Mutex::new(None),
        }
    }
}

impl Default for ObjectAccessStub {
    fn default() -> Self {
        Self::new()
    }
}

impl StubObject for ObjectAccessStub {
    fn link(&self, link: StubLink) -> bool {
        *self.link.lock() = Some(link);
        true
    }

    fn dispatch(&self, mut frames: FrameSeq) -> ComResult<FrameSeq> {
        let (target, access) = {
            let guard = self.link.lock();
            let link = guard.as_ref().ok_or(ComError::NotInitialized)?;
            (link.target.clone(), link.access.clone())
        };

        let payload = frames
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("object-access call without payload".into()))?;
        if payload.len() < 9 || payload[0] != OP_GET_INTERFACE {
            return Err(ComError::Marshalling(
                "malformed object-access payload".into(),
            ));
        }
        let id = InterfaceId(LittleEndian::read_u64(&payload[1..9]));

        let mut reply = Vec::with_capacity(17);
        match target.get_interface(id).and_then(|ifc| access.stub_for(&ifc)) {
            Some(stub_id) => {
                reply.push(1);
                reply.extend_from_slice(&stub_id.to_le_bytes());
            }
            None => reply.push(0),
        }
        Ok(VecDeque::from(vec![reply]))
    }
}
