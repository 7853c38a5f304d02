//! Per-connection channel connector.
//!
//! One connector exists per established channel. It owns the proxy cache
//! for remote stubs, the map of in-flight outbound calls, and a scheduler
//! that decouples inbound invocations from the transport's receive thread.
//!
//! ## Outbound
//!
//! `make_call` prepends the address header, registers a call entry keyed by
//! a fresh call index, submits the frames to the transport, and blocks the
//! caller until the matching response arrives or the call is cancelled.
//! The wait polls the entry state with a short bounded timeout: condition
//! variables are treated as stateless, so a notification that fires before
//! the wait starts cannot strand the waiter.
//!
//! ## Inbound
//!
//! The transport's receive callback takes ownership of the buffer sequence
//! and hands it to a scheduler worker, returning immediately. The worker
//! decodes the header in the byte order announced by the leading byte.
//! Invocations are dispatched to the addressed stub and answered in the
//! source endianness; responses are routed straight to the waiting call
//! entry. Responses for unknown or already-settled call indices are
//! dropped silently.

use crate::component::{InterfaceId, InterfaceRef, OBJECT_ACCESS_INTERFACE};
use crate::control::CommunicationControl;
use crate::error::{ComError, ComResult};
use crate::marshall::MarshallObject;
use crate::scheduler::{ScheduleFlags, TaskScheduler};
use crate::transport::{ChannelEndpoint, ConnectEvents, ConnectStatus, DataReceive, DataSend};
use crate::wire::{
    ConnectionId, DataInterpret, Endian, FrameSeq, MarshallAddress, MarshallId, PROTOCOL_VERSION,
};
use anyhow::{bail, Context, Result};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded wait applied while polling a call entry for its result.
const RESULT_POLL: Duration = Duration::from_millis(1);

/// Grace period after disconnecting, allowing asynchronous disconnect
/// notifications that still reference this connector to complete.
const TEARDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointRole {
    Server,
    Client,
}

enum CallState {
    Processing,
    Processed(FrameSeq),
    Canceled,
}

/// Slot a blocked caller waits on until its response is routed.
struct CallEntry {
    slot: Mutex<CallState>,
    ready: Condvar,
}

impl CallEntry {
    fn new() -> CallEntry {
        CallEntry {
            slot: Mutex::new(CallState::Processing),
            ready: Condvar::new(),
        }
    }

    fn cancel(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, CallState::Processing) {
            *slot = CallState::Canceled;
        }
        self.ready.notify_all();
    }
}

/// Connector for one established channel.
pub struct ChannelConnector {
    control: Weak<CommunicationControl>,
    connection_id: ConnectionId,
    endpoint: Arc<dyn ChannelEndpoint>,
    data_send: Option<Arc<dyn DataSend>>,
    status_cookie: AtomicU64,
    initial_object: Mutex<Option<Arc<MarshallObject>>>,
    status: AtomicCell<ConnectStatus>,
    role: AtomicCell<EndpointRole>,
    allow_reconnect: AtomicBool,
    /// Proxy cache keyed by remote stub identity. Re-entrant: proxy
    /// creation may resolve further proxies on the same connector.
    proxies: ReentrantMutex<RefCell<HashMap<MarshallId, Arc<MarshallObject>>>>,
    calls: Mutex<HashMap<u64, Arc<CallEntry>>>,
    scheduler: TaskScheduler,
    torn_down: AtomicBool,
    self_weak: Weak<ChannelConnector>,
}

impl ChannelConnector {
    pub(crate) fn new(
        control: Weak<CommunicationControl>,
        index: u32,
        endpoint: Arc<dyn ChannelEndpoint>,
    ) -> Arc<ChannelConnector> {
        let data_send = endpoint.sender();
        Arc::new_cyclic(|self_weak| ChannelConnector {
            control,
            connection_id: ConnectionId::new(index),
            endpoint,
            data_send,
            status_cookie: AtomicU64::new(0),
            initial_object: Mutex::new(None),
            status: AtomicCell::new(ConnectStatus::Uninitialized),
            role: AtomicCell::new(EndpointRole::Client),
            allow_reconnect: AtomicBool::new(false),
            proxies: ReentrantMutex::new(RefCell::new(HashMap::new())),
            calls: Mutex::new(HashMap::new()),
            scheduler: TaskScheduler::new(
                crate::defaults::DISPATCH_MIN_IDLE,
                crate::defaults::DISPATCH_MAX_BUSY,
            ),
            torn_down: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    /// Identity of this connection inside the control's channel vector.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether the channel currently reports connected.
    pub fn is_connected(&self) -> bool {
        self.status.load() == ConnectStatus::Connected
    }

    /// Attach the channel to a served object: create (or reuse) its stub as
    /// the initial marshall object and start the asynchronous connect.
    pub(crate) fn server_connect(&self, object: InterfaceRef, allow_reconnect: bool) -> Result<()> {
        if self.data_send.is_none() {
            bail!("endpoint exposes no send capability");
        }
        {
            let mut initial = self.initial_object.lock();
            if initial.is_some() {
                bail!("connector already carries an initial marshall object");
            }
            self.allow_reconnect.store(allow_reconnect, Ordering::SeqCst);
            self.role.store(EndpointRole::Server);

            let control = self
                .control
                .upgrade()
                .context("communication control already released")?;
            let stub = control
                .get_or_create_stub(&object)
                .context("could not create the initial stub")?;
            *initial = Some(stub);
        }

        let callbacks = self
            .self_weak
            .upgrade()
            .context("connector is being released")?;
        let cookie = self
            .endpoint
            .register_status_callback(callbacks.clone() as Arc<dyn ConnectEvents>);
        if cookie == 0 {
            bail!("transport refused the status callback registration");
        }
        self.status_cookie.store(cookie, Ordering::SeqCst);

        if !self.endpoint.async_connect(callbacks as Arc<dyn DataReceive>) {
            bail!("transport refused the connect request");
        }
        Ok(())
    }

    /// Connect to a served channel: create the proxy for the object on the
    /// far end (addressed by the empty sentinel stub identity) and wait for
    /// the connection to come up.
    pub(crate) fn client_connect(&self, timeout: Duration) -> Result<InterfaceRef> {
        if self.data_send.is_none() {
            bail!("endpoint exposes no send capability");
        }
        if timeout.is_zero() {
            bail!("a client connect needs a non-zero timeout");
        }
        if self.initial_object.lock().is_some() {
            bail!("connector already carries an initial marshall object");
        }
        self.role.store(EndpointRole::Client);

        let initial = match self.get_or_create_proxy(OBJECT_ACCESS_INTERFACE, MarshallId::default())
        {
            Some(proxy) => proxy,
            None => bail!("could not create the initial proxy object"),
        };
        *self.initial_object.lock() = Some(initial.clone());

        let callbacks = self
            .self_weak
            .upgrade()
            .context("connector is being released")?;
        let cookie = self
            .endpoint
            .register_status_callback(callbacks.clone() as Arc<dyn ConnectEvents>);
        self.status_cookie.store(cookie, Ordering::SeqCst);

        if cookie == 0
            || !self.endpoint.async_connect(callbacks as Arc<dyn DataReceive>)
            || !self.endpoint.wait_for_connection(timeout)
        {
            self.teardown();
            bail!("could not establish a connection");
        }

        initial
            .proxy_interface()
            .context("initial proxy carries no target interface")
    }

    /// Build the outbound frame, register the call entry, submit, and wait.
    pub(crate) fn make_call(
        &self,
        proxy_id: MarshallId,
        stub_id: MarshallId,
        mut frames: FrameSeq,
    ) -> ComResult<FrameSeq> {
        let data_send = match &self.data_send {
            Some(sender) => sender.clone(),
            None => return Err(ComError::NotInitialized),
        };
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(ComError::Cancelled);
        }
        let control = self.control.upgrade().ok_or(ComError::NotInitialized)?;

        let address = MarshallAddress {
            endian: Endian::native(),
            version: PROTOCOL_VERSION,
            proxy_id,
            stub_id,
            call_index: control.new_call_index(),
            interpret: DataInterpret::InputData,
        };
        frames.push_front(address.encode());

        let entry = Arc::new(CallEntry::new());
        self.calls.lock().insert(address.call_index, entry.clone());

        // Teardown may have drained the call map between the check above
        // and the insert; a late entry would never be cancelled.
        if self.torn_down.load(Ordering::SeqCst) {
            self.calls.lock().remove(&address.call_index);
            return Err(ComError::Cancelled);
        }

        // Interface values inside the payload resolve over this connector.
        if let Some(connector) = self.self_weak.upgrade() {
            control.set_connector_context(&connector);
        }

        if !data_send.send_data(frames) {
            self.calls.lock().remove(&address.call_index);
            return Err(ComError::Marshalling(
                "transport rejected the outbound frame".into(),
            ));
        }

        let mut slot = entry.slot.lock();
        while matches!(*slot, CallState::Processing) {
            entry.ready.wait_for(&mut slot, RESULT_POLL);
        }
        match mem::replace(&mut *slot, CallState::Canceled) {
            CallState::Processed(result) => Ok(result),
            _ => Err(ComError::Cancelled),
        }
    }

    /// Return the cached proxy for a remote stub, creating it on first use.
    pub(crate) fn get_or_create_proxy(
        &self,
        id: InterfaceId,
        stub_id: MarshallId,
    ) -> Option<Arc<MarshallObject>> {
        let cache = self.proxies.lock();
        if let Some(existing) = cache.borrow().get(&stub_id).cloned() {
            return Some(existing);
        }

        let control = self.control.upgrade()?;
        let connector = self.self_weak.upgrade()?;
        let marshall = control.create_proxy(id, stub_id, &connector)?;
        cache.borrow_mut().insert(stub_id, marshall.clone());
        Some(marshall)
    }

    /// Dispatch one decoded frame sequence on a scheduler worker.
    pub(crate) fn decoupled_receive_data(&self, mut frames: FrameSeq) {
        let header = match frames.pop_front() {
            Some(header) => header,
            None => return,
        };
        let address = match MarshallAddress::decode(&header) {
            Ok(address) => address,
            Err(error) => {
                debug!("dropping frame with invalid address header: {error}");
                return;
            }
        };

        match address.interpret {
            DataInterpret::InputData => self.dispatch_invocation(address, frames),
            DataInterpret::OutputData => self.route_response(address, frames),
        }
    }

    /// Inbound invocation: call the addressed stub and answer in the
    /// caller's byte order. A failed invocation produces no response; the
    /// remote waiter observes cancellation through its own channel state.
    fn dispatch_invocation(&self, address: MarshallAddress, frames: FrameSeq) {
        if address.proxy_id.is_empty() {
            debug!("dropping invocation without a proxy identity");
            return;
        }
        let stub_id = if address.stub_id.is_empty() {
            match self.initial_object.lock().as_ref() {
                Some(initial) => initial.marshall_id(),
                None => {
                    debug!("dropping invocation: no initial marshall object bound");
                    return;
                }
            }
        } else {
            address.stub_id
        };
        let control = match self.control.upgrade() {
            Some(control) => control,
            None => return,
        };

        if let Some(connector) = self.self_weak.upgrade() {
            control.set_connector_context(&connector);
        }

        let result = match control.call_stub(stub_id, frames) {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    "inbound invocation on call {} failed: {error}",
                    address.call_index
                );
                return;
            }
        };

        let mut response = result;
        let mut response_address = address;
        response_address.interpret = DataInterpret::OutputData;
        // The header keeps the source endianness, so the caller receives
        // its own byte order.
        response.push_front(response_address.encode());

        if let Some(sender) = &self.data_send {
            if !sender.send_data(response) {
                debug!("could not return the response for call {}", address.call_index);
            }
        }
    }

    /// Response routing: hand the result to the registered waiter, drop
    /// anything unmatched.
    fn route_response(&self, address: MarshallAddress, frames: FrameSeq) {
        let entry = match self.calls.lock().remove(&address.call_index) {
            Some(entry) => entry,
            None => {
                debug!("dropping response for unknown call {}", address.call_index);
                return;
            }
        };
        let mut slot = entry.slot.lock();
        if matches!(*slot, CallState::Processing) {
            *slot = CallState::Processed(frames);
            entry.ready.notify_all();
        }
    }

    fn invalidate_proxies(&self) {
        self.proxies.lock().borrow_mut().clear();
    }

    fn cancel_all_calls(&self) {
        let drained: Vec<Arc<CallEntry>> = {
            let mut calls = self.calls.lock();
            calls.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.cancel();
        }
    }

    /// Release the channel: cancel waiters, detach from the transport,
    /// drain the dispatch pool, and grant asynchronous notifications a
    /// grace period. Idempotent; also runs on drop.
    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel_all_calls();

        let cookie = self.status_cookie.swap(0, Ordering::SeqCst);
        if cookie != 0 {
            self.endpoint.unregister_status_callback(cookie);
        }
        self.endpoint.disconnect();

        self.scheduler.wait_for_execution();

        self.invalidate_proxies();
        *self.initial_object.lock() = None;

        thread::sleep(TEARDOWN_GRACE);
    }
}

impl ConnectEvents for ChannelConnector {
    fn set_status(&self, status: ConnectStatus) {
        let previous = self.status.swap(status);
        if previous == status {
            return;
        }
        match status {
            ConnectStatus::Connected => {
                if self.role.load() == EndpointRole::Server {
                    info!("client connected (id#{})", self.connection_id.index);
                }
            }
            ConnectStatus::Disconnected | ConnectStatus::DisconnectedForced => {
                self.invalidate_proxies();
                self.cancel_all_calls();
                if self.role.load() == EndpointRole::Server {
                    info!("client disconnected (id#{})", self.connection_id.index);
                }
                if !self.allow_reconnect.load(Ordering::SeqCst) {
                    if let Some(control) = self.control.upgrade() {
                        control.remove_connection(self.connection_id);
                    }
                }
            }
            ConnectStatus::Uninitialized => {}
        }
    }
}

impl DataReceive for ChannelConnector {
    fn receive_data(&self, frames: &mut FrameSeq) {
        // Ownership moves into the task closure here, before returning, so
        // the transport may reuse its buffers immediately.
        let frames = mem::take(frames);
        let connector = match self.self_weak.upgrade() {
            Some(connector) => connector,
            None => return,
        };
        let accepted = self.scheduler.schedule(
            move || connector.decoupled_receive_data(frames),
            ScheduleFlags::empty(),
        );
        if !accepted {
            warn!("dropping inbound frame: dispatch pool refused the task");
        }
    }
}

impl Drop for ChannelConnector {
    fn drop(&mut self) {
        self.teardown();
    }
}
