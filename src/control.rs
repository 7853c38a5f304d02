//! Process-wide communication control.
//!
//! The control owns the vector of channel connectors, the directory of
//! marshall objects, and the process-unique call-index allocator. Both the
//! channel vector and the marshall vector are dense with stable indices:
//! removed entries are nulled in place, never compacted, so `{index,
//! control}` identifiers stay valid for the control's lifetime.
//!
//! The marshall vector holds weak references only. Ownership lives with
//! the stub map (for stubs) and the connectors' proxy caches (for
//! proxies), so the directory never extends an object's lifetime beyond
//! its useful scope.
//!
//! Proxy resolution for interface-valued payload fields runs against the
//! per-thread "current connector", recorded at both dispatch entry points.
//! Looking the connector up thread-locally keeps payload decoding from
//! re-entering the control's locks.

use crate::component::{InterfaceId, InterfaceRef};
use crate::config;
use crate::connector::ChannelConnector;
use crate::error::{ComError, ComResult};
use crate::marshall::{CallForwarder, MarshallAccess, MarshallObject};
use crate::repository::{MarshallRepository, ProxyLink, ProxyObject, StubLink, StubObject};
use crate::transport::{ChannelEndpoint, ChannelKind, TransportProvider};
use crate::wire::{ConnectionId, FrameSeq, MarshallId};
use anyhow::{bail, Context, Result};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle state of the control. Transitions move monotonically toward
/// shutdown; configuring and running may alternate in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    InitializationPending,
    Initialized,
    Configuring,
    Running,
    ShutdownInProgress,
    DestructionPending,
}

/// Operation mode requested by the hosting runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Configuring,
    Running,
}

thread_local! {
    /// The connector currently dispatching a call on this thread.
    static CONNECTOR_CONTEXT: RefCell<Weak<ChannelConnector>> = RefCell::new(Weak::new());
}

struct MarshallDirectory {
    /// Dense vector of every marshall object ever created; weak entries,
    /// position equals `MarshallId::index`.
    vector: Vec<Weak<MarshallObject>>,
    /// Single source of truth for stubs, keyed by component identity and
    /// interface role.
    stubs: HashMap<(usize, InterfaceId), Arc<MarshallObject>>,
}

/// Process-wide connection and marshalling registry.
pub struct CommunicationControl {
    status: AtomicCell<ObjectStatus>,
    process_id: u32,
    repository: Arc<dyn MarshallRepository>,
    transports: RwLock<HashMap<String, Arc<dyn TransportProvider>>>,
    channels: Mutex<Vec<Option<Arc<ChannelConnector>>>>,
    /// Re-entrant: creating a stub or proxy may marshal further interface
    /// values, which resolves through this directory again.
    objects: ReentrantMutex<RefCell<MarshallDirectory>>,
    call_counter: AtomicU64,
    self_weak: Weak<CommunicationControl>,
}

impl CommunicationControl {
    /// Create the control over the supplied marshall-object repository.
    pub fn new(repository: Arc<dyn MarshallRepository>) -> Arc<CommunicationControl> {
        Arc::new_cyclic(|self_weak| CommunicationControl {
            status: AtomicCell::new(ObjectStatus::InitializationPending),
            process_id: std::process::id(),
            repository,
            transports: RwLock::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            objects: ReentrantMutex::new(RefCell::new(MarshallDirectory {
                vector: Vec::new(),
                stubs: HashMap::new(),
            })),
            call_counter: AtomicU64::new(0),
            self_weak: self_weak.clone(),
        })
    }

    pub fn initialize(&self) {
        self.status.store(ObjectStatus::Initialized);
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

    /// Make a transport provider available under its printable name.
    pub fn register_transport(&self, provider: Arc<dyn TransportProvider>) {
        self.transports
            .write()
            .insert(provider.name().to_string(), provider);
    }

    /// Look a transport provider up by its printable name.
    pub fn transport(&self, name: &str) -> Option<Arc<dyn TransportProvider>> {
        self.transports.read().get(name).cloned()
    }

    /// Create a fresh endpoint on the transport family and serve `object`
    /// over it. Returns the connection identity and the printable string a
    /// peer needs to reach the endpoint.
    pub fn create_server_connection(
        self: &Arc<Self>,
        kind: ChannelKind,
        object: InterfaceRef,
        timeout: Duration,
    ) -> Result<(ConnectionId, String)> {
        let provider = self
            .transport(kind.provider_name())
            .with_context(|| format!("no transport provider for {:?} channels", kind))?;
        let handle = provider
            .create_endpoint("")
            .context("could not create the endpoint")?;
        let id = self.assign_server_endpoint(handle.endpoint, object, timeout, false)?;
        Ok((id, handle.connect_string))
    }

    /// Access the endpoint described by a connection string and connect to
    /// the object served on its far end.
    pub fn create_client_connection(
        self: &Arc<Self>,
        connect_string: &str,
        timeout: Duration,
    ) -> Result<(ConnectionId, InterfaceRef)> {
        let provider_name = config::provider_name(connect_string)?;
        let provider = self
            .transport(&provider_name)
            .with_context(|| format!("no transport provider named {provider_name:?}"))?;
        let endpoint = provider
            .access(connect_string)
            .context("could not access the endpoint")?;
        self.assign_client_endpoint(endpoint, timeout)
    }

    /// Take over an initialized server endpoint: allocate the next channel
    /// slot, attach the served object, and start the asynchronous connect.
    pub fn assign_server_endpoint(
        self: &Arc<Self>,
        endpoint: Arc<dyn ChannelEndpoint>,
        object: InterfaceRef,
        timeout: Duration,
        allow_reconnect: bool,
    ) -> Result<ConnectionId> {
        if timeout.is_zero() && !allow_reconnect {
            bail!("a server endpoint needs a timeout or the reconnect flag");
        }
        // The timeout would drive an initial-connect watchdog; a served
        // channel currently persists until removed or shut down.
        let _ = timeout;

        let mut channels = self.channels.lock();
        let index = channels.len() as u32;
        let connector = ChannelConnector::new(Arc::downgrade(self), index, endpoint);
        connector
            .server_connect(object, allow_reconnect)
            .context("could not attach the server endpoint")?;
        let id = connector.connection_id();
        channels.push(Some(connector));
        Ok(id)
    }

    /// Take over an initialized client endpoint, wait for the connection,
    /// and hand back the proxy for the object on the far end.
    pub fn assign_client_endpoint(
        self: &Arc<Self>,
        endpoint: Arc<dyn ChannelEndpoint>,
        timeout: Duration,
    ) -> Result<(ConnectionId, InterfaceRef)> {
        let mut channels = self.channels.lock();
        let index = channels.len() as u32;
        let connector = ChannelConnector::new(Arc::downgrade(self), index, endpoint);
        let proxy = connector
            .client_connect(timeout)
            .context("could not connect the client endpoint")?;
        let id = connector.connection_id();
        channels.push(Some(connector));
        Ok((id, proxy))
    }

    /// Release a connection. The slot is nulled in place so later
    /// connection identities keep their indices; removing an already
    /// removed connection is a no-op.
    pub fn remove_connection(&self, id: ConnectionId) {
        let removed = {
            let mut channels = self.channels.lock();
            match channels.get_mut(id.index as usize) {
                Some(slot) if slot.as_ref().map(|c| c.connection_id()) == Some(id) => slot.take(),
                _ => None,
            }
        };
        if let Some(connector) = removed {
            debug!("removing connection id#{}", id.index);
            connector.teardown();
        }
    }

    /// Resolve (or create) the stub identity for a local interface.
    pub fn get_stub(&self, interface: &InterfaceRef) -> Option<MarshallId> {
        self.get_or_create_stub(interface)
            .map(|stub| stub.marshall_id())
    }

    /// Resolve a stub identity into a proxy interface over the connector
    /// currently dispatching on this thread.
    pub fn get_proxy(&self, stub_id: MarshallId, id: InterfaceId) -> Option<InterfaceRef> {
        let connector = Self::current_connector()?;
        let proxy = connector.get_or_create_proxy(id, stub_id)?;
        proxy.proxy_interface()
    }

    /// Invoke the stub addressed by an inbound frame.
    ///
    /// The identity must reference a live directory slot and match its
    /// control value; anything else fails the integrity check so a forged
    /// identifier cannot reach an unrelated object.
    pub(crate) fn call_stub(&self, stub_id: MarshallId, frames: FrameSeq) -> ComResult<FrameSeq> {
        let marshall = {
            let directory = self.objects.lock();
            let entry = {
                let borrowed = directory.borrow();
                if stub_id.index as usize >= borrowed.vector.len() {
                    return Err(ComError::Integrity);
                }
                borrowed.vector[stub_id.index as usize].clone()
            };
            entry.upgrade().ok_or(ComError::Integrity)?
        };
        if marshall.marshall_id() != stub_id {
            return Err(ComError::Integrity);
        }
        marshall.call(frames)
    }

    /// Create a proxy marshall object bound to a connector. Proxies are
    /// cached per connector, not here; the directory only records the weak
    /// entry that gives the identifier its index.
    pub(crate) fn create_proxy(
        &self,
        id: InterfaceId,
        stub_id: MarshallId,
        connector: &Arc<ChannelConnector>,
    ) -> Option<Arc<MarshallObject>> {
        let directory = self.objects.lock();

        let raw: Arc<dyn ProxyObject> = match self.repository.create_proxy_object(id) {
            Some(object) => Arc::from(object),
            None => {
                warn!("repository cannot create a proxy object for interface {id}");
                return None;
            }
        };

        let index = directory.borrow().vector.len() as u32;
        let ident = MarshallId::new(self.process_id, index);
        let marshall = Arc::new(MarshallObject::new_proxy(
            ident,
            stub_id,
            Arc::downgrade(connector),
            raw.clone(),
        ));
        directory.borrow_mut().vector.push(Arc::downgrade(&marshall));

        // Linking may re-enter the directory when the codec resolves
        // interface values, so no borrow is held across it.
        raw.link(ProxyLink {
            ident,
            forwarder: CallForwarder::new(Arc::downgrade(&marshall)),
            access: self.marshall_access(),
        });
        if raw.target_interface().is_none() {
            warn!("proxy object for interface {id} carries no target interface");
            return None;
        }
        Some(marshall)
    }

    /// Resolve (or create) the stub marshall object for a local interface.
    /// Two resolutions of the same component in the same role yield the
    /// same stub.
    pub(crate) fn get_or_create_stub(&self, interface: &InterfaceRef) -> Option<Arc<MarshallObject>> {
        let directory = self.objects.lock();
        let key = interface.key();
        if let Some(existing) = directory.borrow().stubs.get(&key).cloned() {
            return Some(existing);
        }

        let raw: Arc<dyn StubObject> = match self.repository.create_stub_object(interface.id()) {
            Some(object) => Arc::from(object),
            None => {
                warn!(
                    "repository cannot create a stub object for interface {}",
                    interface.id()
                );
                return None;
            }
        };

        let index = directory.borrow().vector.len() as u32;
        let ident = MarshallId::new(self.process_id, index);
        let marshall = Arc::new(MarshallObject::new_stub(ident, interface.clone(), raw.clone()));
        directory.borrow_mut().vector.push(Arc::downgrade(&marshall));
        directory.borrow_mut().stubs.insert(key, marshall.clone());

        if !raw.link(StubLink {
            ident,
            target: interface.clone(),
            access: self.marshall_access(),
        }) {
            directory.borrow_mut().stubs.remove(&key);
            return None;
        }
        Some(marshall)
    }

    /// Allocate the next process-unique call index.
    pub(crate) fn new_call_index(&self) -> u64 {
        self.call_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Record the connector currently dispatching on this thread.
    pub(crate) fn set_connector_context(&self, connector: &Arc<ChannelConnector>) {
        CONNECTOR_CONTEXT.with(|context| *context.borrow_mut() = Arc::downgrade(connector));
    }

    fn current_connector() -> Option<Arc<ChannelConnector>> {
        CONNECTOR_CONTEXT.with(|context| context.borrow().upgrade())
    }

    /// Marshalling access handed to generated codecs.
    pub fn marshall_access(&self) -> MarshallAccess {
        MarshallAccess::new(self.self_weak.clone())
    }

    /// Shut the control down: release every connection, then the stub
    /// directory. Both collections are moved aside first so destructors
    /// cannot re-enter the control's locks.
    pub fn shutdown(&self) {
        self.status.store(ObjectStatus::ShutdownInProgress);

        let channels: Vec<Arc<ChannelConnector>> =
            { self.channels.lock().drain(..).flatten().collect() };
        for connector in &channels {
            connector.teardown();
        }
        drop(channels);

        let stubs: Vec<Arc<MarshallObject>> = {
            let directory = self.objects.lock();
            let drained = directory.borrow_mut().stubs.drain().map(|(_, s)| s).collect();
            drained
        };
        drop(stubs);

        self.status.store(ObjectStatus::DestructionPending);
    }

    #[cfg(test)]
    pub(crate) fn connector_for_test(&self, id: ConnectionId) -> Option<Arc<ChannelConnector>> {
        self.channels
            .lock()
            .get(id.index as usize)
            .and_then(|slot| slot.clone())
    }
}
