//! Shared fixtures: a small greeting service with a hand-written
//! marshalling codec, plus control assembly helpers.
//!
//! The codec mirrors what the interface compiler would generate for
//!
//! ```text
//! interface ISayHello {
//!     hello() -> string;
//!     request() -> ISayHello;
//!     register(callback: ISayHello);
//! }
//! ```
//!
//! and exercises every marshalling direction: plain values, interfaces
//! returned by the server, and interfaces supplied by the client.

#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use sdv_ipc::{
    CodecRegistry, ComError, ComResult, CommunicationControl, ComponentInterface, FrameSeq,
    InterfaceId, InterfaceRef, LocalTransport, MarshallId, ProxyLink, ProxyObject, StubLink,
    StubObject, TcpTransport, OBJECT_ACCESS_INTERFACE,
};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const SAY_HELLO_INTERFACE: InterfaceId = InterfaceId(0x1001);

const OP_HELLO: u8 = 0;
const OP_REQUEST: u8 = 1;
const OP_REGISTER: u8 = 2;

/// The greeting interface the tests marshal across channels.
pub trait SayHello: Send + Sync {
    fn hello(&self) -> ComResult<String>;
    fn request(&self) -> ComResult<InterfaceRef>;
    fn register(&self, callback: InterfaceRef) -> ComResult<()>;
}

/// Invoke `hello` on a reference that may be a local service or a proxy.
pub fn call_hello(interface: &InterfaceRef) -> ComResult<String> {
    if let Some(proxy) = interface.downcast::<SayHelloClient>() {
        return proxy.hello();
    }
    if let Some(service) = interface.downcast::<HelloService>() {
        return service.hello();
    }
    Err(ComError::NotInitialized)
}

/// Greeting service used on both ends of the tests.
pub struct HelloService {
    greeting: String,
    delay: Option<Duration>,
    registered: Mutex<Option<InterfaceRef>>,
    self_weak: Weak<HelloService>,
}

impl HelloService {
    pub fn new() -> Arc<HelloService> {
        Self::build("Hello", None)
    }

    pub fn with_greeting(greeting: &str) -> Arc<HelloService> {
        Self::build(greeting, None)
    }

    /// A service whose `hello` stalls; used to park a caller mid-call.
    pub fn with_delay(greeting: &str, delay: Duration) -> Arc<HelloService> {
        Self::build(greeting, Some(delay))
    }

    fn build(greeting: &str, delay: Option<Duration>) -> Arc<HelloService> {
        Arc::new_cyclic(|self_weak| HelloService {
            greeting: greeting.to_string(),
            delay,
            registered: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// The service in its root role, ready to be served on a channel.
    pub fn as_root(self: &Arc<Self>) -> InterfaceRef {
        InterfaceRef::new(OBJECT_ACCESS_INTERFACE, self.clone())
    }

    /// The interface a peer registered through `register`, if any.
    pub fn registered(&self) -> Option<InterfaceRef> {
        self.registered.lock().clone()
    }
}

impl ComponentInterface for HelloService {
    fn get_interface(&self, id: InterfaceId) -> Option<InterfaceRef> {
        if id == SAY_HELLO_INTERFACE {
            let service = self.self_weak.upgrade()?;
            Some(InterfaceRef::new(SAY_HELLO_INTERFACE, service))
        } else {
            None
        }
    }
}

impl SayHello for HelloService {
    fn hello(&self) -> ComResult<String> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self.greeting.clone())
    }

    fn request(&self) -> ComResult<InterfaceRef> {
        let service = self.self_weak.upgrade().ok_or(ComError::NotInitialized)?;
        Ok(InterfaceRef::new(SAY_HELLO_INTERFACE, service))
    }

    fn register(&self, callback: InterfaceRef) -> ComResult<()> {
        *self.registered.lock() = Some(callback);
        Ok(())
    }
}

/// Raw proxy object for the greeting interface.
pub struct SayHelloProxy {
    client: Arc<SayHelloClient>,
}

impl SayHelloProxy {
    pub fn new() -> SayHelloProxy {
        SayHelloProxy {
            client: Arc::new(SayHelloClient {
                link: Mutex::new(None),
            }),
        }
    }
}

impl ProxyObject for SayHelloProxy {
    fn link(&self, link: ProxyLink) {
        *self.client.link.lock() = Some(link);
    }

    fn target_interface(&self) -> Option<InterfaceRef> {
        Some(InterfaceRef::new(SAY_HELLO_INTERFACE, self.client.clone()))
    }
}

/// Client-side greeting interface; forwards across the wire.
pub struct SayHelloClient {
    link: Mutex<Option<ProxyLink>>,
}

impl SayHelloClient {
    fn linked(&self) -> ComResult<(sdv_ipc::CallForwarder, sdv_ipc::MarshallAccess)> {
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(ComError::NotInitialized)?;
        Ok((link.forwarder.clone(), link.access.clone()))
    }
}

impl ComponentInterface for SayHelloClient {}

impl SayHello for SayHelloClient {
    fn hello(&self) -> ComResult<String> {
        let (forwarder, _) = self.linked()?;
        let mut reply = forwarder.call(VecDeque::from(vec![vec![OP_HELLO]]))?;
        let payload = reply
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("hello reply without payload".into()))?;
        read_string(&payload, 0)
    }

    fn request(&self) -> ComResult<InterfaceRef> {
        let (forwarder, access) = self.linked()?;
        let mut reply = forwarder.call(VecDeque::from(vec![vec![OP_REQUEST]]))?;
        let payload = reply
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("request reply without payload".into()))?;
        if payload.first() != Some(&1) {
            return Err(ComError::Marshalling("peer returned no interface".into()));
        }
        let stub_id = MarshallId::from_le_bytes(&payload[1..])
            .ok_or_else(|| ComError::Marshalling("truncated interface identity".into()))?;
        access
            .proxy_for(stub_id, SAY_HELLO_INTERFACE)
            .ok_or_else(|| ComError::Marshalling("could not resolve the interface".into()))
    }

    fn register(&self, callback: InterfaceRef) -> ComResult<()> {
        let (forwarder, access) = self.linked()?;
        let stub_id = access
            .stub_for(&callback)
            .ok_or_else(|| ComError::Marshalling("could not marshal the callback".into()))?;
        let mut request = vec![OP_REGISTER];
        request.extend_from_slice(&stub_id.to_le_bytes());
        let mut reply = forwarder.call(VecDeque::from(vec![request]))?;
        match reply.pop_front() {
            Some(payload) if payload.first() == Some(&1) => Ok(()),
            _ => Err(ComError::Marshalling("register was not acknowledged".into())),
        }
    }
}

/// Raw stub object for the greeting interface.
pub struct SayHelloStub {
    link: Mutex<Option<(Arc<HelloService>, sdv_ipc::MarshallAccess)>>,
}

impl SayHelloStub {
    pub fn new() -> SayHelloStub {
        SayHelloStub {
            link: Mutex::new(None),
        }
    }
}

impl StubObject for SayHelloStub {
    fn link(&self, link: StubLink) -> bool {
        match link.target.downcast::<HelloService>() {
            Some(service) => {
                *self.link.lock() = Some((service, link.access));
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, mut frames: FrameSeq) -> ComResult<FrameSeq> {
        let (service, access) = self
            .link
            .lock()
            .clone()
            .ok_or(ComError::NotInitialized)?;
        let payload = frames
            .pop_front()
            .ok_or_else(|| ComError::Marshalling("hello call without payload".into()))?;
        let op = *payload
            .first()
            .ok_or_else(|| ComError::Marshalling("empty hello payload".into()))?;

        let mut reply = Vec::new();
        match op {
            OP_HELLO => {
                let greeting = service.hello()?;
                write_string(&mut reply, &greeting)?;
            }
            OP_REQUEST => {
                let interface = service.request()?;
                match access.stub_for(&interface) {
                    Some(stub_id) => {
                        reply.push(1);
                        reply.extend_from_slice(&stub_id.to_le_bytes());
                    }
                    None => reply.push(0),
                }
            }
            OP_REGISTER => {
                let stub_id = MarshallId::from_le_bytes(&payload[1..])
                    .ok_or_else(|| ComError::Marshalling("truncated callback identity".into()))?;
                let callback = access
                    .proxy_for(stub_id, SAY_HELLO_INTERFACE)
                    .ok_or_else(|| ComError::Marshalling("could not resolve the callback".into()))?;
                service.register(callback)?;
                reply.push(1);
            }
            other => {
                return Err(ComError::Marshalling(format!(
                    "unknown hello operation {other}"
                )))
            }
        }
        Ok(VecDeque::from(vec![reply]))
    }
}

fn write_string(buffer: &mut Vec<u8>, value: &str) -> ComResult<()> {
    buffer
        .write_u32::<LittleEndian>(value.len() as u32)
        .map_err(|error| ComError::Marshalling(error.to_string()))?;
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

fn read_string(payload: &[u8], offset: usize) -> ComResult<String> {
    let header = payload
        .get(offset..offset + 4)
        .ok_or_else(|| ComError::Marshalling("truncated string".into()))?;
    let length = LittleEndian::read_u32(header) as usize;
    let bytes = payload
        .get(offset + 4..offset + 4 + length)
        .ok_or_else(|| ComError::Marshalling("truncated string".into()))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ComError::Marshalling("invalid utf-8".into()))
}

/// Codec registry with the greeting interface registered.
pub fn hello_registry() -> Arc<CodecRegistry> {
    let mut registry = CodecRegistry::new();
    registry.register_proxy(SAY_HELLO_INTERFACE, || Box::new(SayHelloProxy::new()));
    registry.register_stub(SAY_HELLO_INTERFACE, || Box::new(SayHelloStub::new()));
    Arc::new(registry)
}

/// A control with the in-process transport registered.
pub fn control_with_local() -> Arc<CommunicationControl> {
    let control = CommunicationControl::new(hello_registry());
    control.initialize();
    control.register_transport(Arc::new(LocalTransport));
    control
}

/// A control with the TCP transport registered.
pub fn control_with_tcp() -> Arc<CommunicationControl> {
    let control = CommunicationControl::new(hello_registry());
    control.initialize();
    control.register_transport(Arc::new(TcpTransport));
    control
}

/// Resolve the greeting interface on a served root proxy.
pub fn hello_interface(root: &InterfaceRef) -> Arc<SayHelloClient> {
    root.get_interface(SAY_HELLO_INTERFACE)
        .expect("peer exposes no greeting interface")
        .downcast::<SayHelloClient>()
        .expect("unexpected greeting proxy type")
}

/// Install a test subscriber; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
