//! In-process rendezvous transport.
//!
//! Server endpoints register under a printable channel name in a
//! process-global table; clients access them by name. One session is
//! active per endpoint at a time, and a fresh session can attach after a
//! disconnect, which is what listener channels rely on. Frames travel
//! through unbounded channels with one pump thread per direction, so the
//! sending side never blocks on the receiver's dispatch.

use super::{
    ChannelEndpoint, ConnectEvents, ConnectStatus, DataReceive, DataSend, EndpointCore,
    EndpointHandle, TransportProvider,
};
use crate::config;
use crate::wire::FrameSeq;
use anyhow::{bail, Context, Result};
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Printable name embedded in connection strings.
pub const PROVIDER_NAME: &str = "Local";

/// Pump poll interval; bounds how long a pump lingers after close.
const PUMP_POLL: Duration = Duration::from_millis(100);

lazy_static! {
    /// Process-global table of served channels, keyed by channel name.
    static ref LISTEN_TABLE: Mutex<HashMap<String, Arc<LocalServerState>>> =
        Mutex::new(HashMap::new());
}

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(0);

struct LocalServerState {
    name: String,
    core: EndpointCore,
    /// Sender toward the currently attached client, if any.
    session: Mutex<Option<Sender<FrameSeq>>>,
}

/// Provider for in-process channels.
pub struct LocalTransport;

impl TransportProvider for LocalTransport {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn create_endpoint(&self, config: &str) -> Result<EndpointHandle> {
        let settings = config::parse_endpoint(config)?;
        let name = settings
            .name
            .unwrap_or_else(|| format!("CHANNEL_{}", NEXT_CHANNEL.fetch_add(1, Ordering::SeqCst)));

        let state = Arc::new(LocalServerState {
            name: name.clone(),
            core: EndpointCore::new(),
            session: Mutex::new(None),
        });
        {
            let mut table = LISTEN_TABLE.lock();
            if table.contains_key(&name) {
                bail!("local channel {name:?} already exists");
            }
            table.insert(name.clone(), state.clone());
        }
        debug!("serving local channel {name:?}");

        let endpoint = Arc::new(LocalServerEndpoint {
            send: Arc::new(LocalServerSend {
                state: state.clone(),
            }),
            state,
        });
        let connect_string =
            format!("[Provider]\nName = \"{PROVIDER_NAME}\"\n\n[IpcChannel]\nName = \"{name}\"\n");
        Ok(EndpointHandle {
            endpoint,
            connect_string,
        })
    }

    fn access(&self, connect_string: &str) -> Result<Arc<dyn ChannelEndpoint>> {
        let settings = config::parse_endpoint(connect_string)?;
        let name = settings
            .name
            .context("local connection string names no channel")?;
        let peer = LISTEN_TABLE
            .lock()
            .get(&name)
            .cloned()
            .with_context(|| format!("no local channel named {name:?}"))?;
        Ok(Arc::new(LocalClientEndpoint {
            core: Arc::new(EndpointCore::new()),
            peer,
            send: Arc::new(LocalClientSend {
                tx: Mutex::new(None),
            }),
        }))
    }
}

struct LocalServerSend {
    state: Arc<LocalServerState>,
}

impl DataSend for LocalServerSend {
    fn send_data(&self, frames: FrameSeq) -> bool {
        match self.state.session.lock().as_ref() {
            Some(tx) => tx.send(frames).is_ok(),
            None => false,
        }
    }
}

struct LocalServerEndpoint {
    state: Arc<LocalServerState>,
    send: Arc<LocalServerSend>,
}

impl ChannelEndpoint for LocalServerEndpoint {
    fn sender(&self) -> Option<Arc<dyn DataSend>> {
        Some(self.send.clone())
    }

    fn async_connect(&self, receive: Arc<dyn DataReceive>) -> bool {
        if self.state.core.is_closed() {
            return false;
        }
        // The transition to connected happens when a client attaches.
        self.state.core.set_receive(receive);
        true
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.state.core.wait_for_connection(timeout)
    }

    fn disconnect(&self) {
        self.state.core.close();
        LISTEN_TABLE.lock().remove(&self.state.name);
        // Dropping the session sender ends the client-bound pump.
        *self.state.session.lock() = None;
        self.state.core.clear_receive();
        self.state.core.set_status(ConnectStatus::Disconnected);
        debug!("closed local channel {:?}", self.state.name);
    }

    fn register_status_callback(&self, events: Arc<dyn ConnectEvents>) -> u64 {
        self.state.core.register_status_callback(events)
    }

    fn unregister_status_callback(&self, cookie: u64) {
        self.state.core.unregister_status_callback(cookie)
    }

    fn status(&self) -> ConnectStatus {
        self.state.core.status()
    }
}

struct LocalClientSend {
    tx: Mutex<Option<Sender<FrameSeq>>>,
}

impl DataSend for LocalClientSend {
    fn send_data(&self, frames: FrameSeq) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frames).is_ok(),
            None => false,
        }
    }
}

struct LocalClientEndpoint {
    core: Arc<EndpointCore>,
    peer: Arc<LocalServerState>,
    send: Arc<LocalClientSend>,
}

impl ChannelEndpoint for LocalClientEndpoint {
    fn sender(&self) -> Option<Arc<dyn DataSend>> {
        Some(self.send.clone())
    }

    fn async_connect(&self, receive: Arc<dyn DataReceive>) -> bool {
        if self.core.is_closed() || self.peer.core.is_closed() {
            return false;
        }
        let server_receive = match self.peer.core.receive() {
            Some(callback) => callback,
            None => {
                debug!("local channel {:?} is not accepting yet", self.peer.name);
                return false;
            }
        };
        {
            let mut session = self.peer.session.lock();
            if session.is_some() {
                debug!("local channel {:?} already has a client", self.peer.name);
                return false;
            }
            let (client_tx, server_rx) = unbounded::<FrameSeq>();
            let (server_tx, client_rx) = unbounded::<FrameSeq>();
            *session = Some(server_tx);
            *self.send.tx.lock() = Some(client_tx);
            self.core.set_receive(receive.clone());

            // Server-side pump: client frames toward the server callback.
            let state = self.peer.clone();
            thread::spawn(move || {
                loop {
                    if state.core.is_closed() {
                        break;
                    }
                    match server_rx.recv_timeout(PUMP_POLL) {
                        Ok(mut frames) => server_receive.receive_data(&mut frames),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                *state.session.lock() = None;
                state.core.set_status(ConnectStatus::Disconnected);
            });

            // Client-side pump: server frames toward the client callback.
            let core = self.core.clone();
            thread::spawn(move || {
                loop {
                    if core.is_closed() {
                        break;
                    }
                    match client_rx.recv_timeout(PUMP_POLL) {
                        Ok(mut frames) => receive.receive_data(&mut frames),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                core.set_status(ConnectStatus::Disconnected);
                core.clear_receive();
            });
        }

        self.peer.core.set_status(ConnectStatus::Connected);
        self.core.set_status(ConnectStatus::Connected);
        true
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.core.wait_for_connection(timeout)
    }

    fn disconnect(&self) {
        self.core.close();
        // Dropping the sender ends the server-bound pump, which clears the
        // session slot on the server side.
        *self.send.tx.lock() = None;
        self.core.clear_receive();
        self.core.set_status(ConnectStatus::Disconnected);
    }

    fn register_status_callback(&self, events: Arc<dyn ConnectEvents>) -> u64 {
        self.core.register_status_callback(events)
    }

    fn unregister_status_callback(&self, cookie: u64) {
        self.core.unregister_status_callback(cookie)
    }

    fn status(&self) -> ConnectStatus {
        self.core.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    struct Recorder {
        frames: StdMutex<Vec<FrameSeq>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                frames: StdMutex::new(Vec::new()),
            })
        }

        fn wait_for(&self, count: usize, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.frames.lock().unwrap().len() >= count {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    impl DataReceive for Recorder {
        fn receive_data(&self, frames: &mut FrameSeq) {
            self.frames.lock().unwrap().push(std::mem::take(frames));
        }
    }

    fn frames_of(bytes: &[u8]) -> FrameSeq {
        FrameSeq::from(vec![bytes.to_vec()])
    }

    #[test]
    fn frames_flow_in_both_directions() {
        let provider = LocalTransport;
        let handle = provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_DUPLEX\"\n")
            .unwrap();
        let server = handle.endpoint;
        let client = provider.access(&handle.connect_string).unwrap();

        let server_frames = Recorder::new();
        let client_frames = Recorder::new();
        assert!(server.async_connect(server_frames.clone()));
        assert!(client.async_connect(client_frames.clone()));
        assert!(server.wait_for_connection(Duration::from_secs(1)));
        assert!(client.wait_for_connection(Duration::from_secs(1)));

        assert!(client.sender().unwrap().send_data(frames_of(b"ping")));
        assert!(server.sender().unwrap().send_data(frames_of(b"pong")));
        assert!(server_frames.wait_for(1, Duration::from_secs(1)));
        assert!(client_frames.wait_for(1, Duration::from_secs(1)));
        assert_eq!(server_frames.frames.lock().unwrap()[0][0], b"ping");
        assert_eq!(client_frames.frames.lock().unwrap()[0][0], b"pong");

        client.disconnect();
        server.disconnect();
    }

    #[test]
    fn a_second_client_is_refused_while_a_session_is_active() {
        let provider = LocalTransport;
        let handle = provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_BUSY\"\n")
            .unwrap();
        let server = handle.endpoint;
        assert!(server.async_connect(Recorder::new()));

        let first = provider.access(&handle.connect_string).unwrap();
        assert!(first.async_connect(Recorder::new()));

        let second = provider.access(&handle.connect_string).unwrap();
        assert!(!second.async_connect(Recorder::new()));

        first.disconnect();
        server.disconnect();
    }

    #[test]
    fn a_closed_channel_disappears_from_the_table() {
        let provider = LocalTransport;
        let handle = provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_CLOSED\"\n")
            .unwrap();
        handle.endpoint.disconnect();
        assert!(provider.access(&handle.connect_string).is_err());
    }

    #[test]
    fn duplicate_channel_names_are_rejected() {
        let provider = LocalTransport;
        let handle = provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_DUP\"\n")
            .unwrap();
        assert!(provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_DUP\"\n")
            .is_err());
        handle.endpoint.disconnect();
    }

    #[test]
    fn peer_disconnect_reaches_the_other_side() {
        let provider = LocalTransport;
        let handle = provider
            .create_endpoint("[IpcChannel]\nName = \"LOCAL_TEST_HANGUP\"\n")
            .unwrap();
        let server = handle.endpoint;
        assert!(server.async_connect(Recorder::new()));
        let client = provider.access(&handle.connect_string).unwrap();
        assert!(client.async_connect(Recorder::new()));
        assert!(client.wait_for_connection(Duration::from_secs(1)));

        client.disconnect();
        let deadline = Instant::now() + Duration::from_secs(1);
        while server.status() != ConnectStatus::Disconnected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.status(), ConnectStatus::Disconnected);
        server.disconnect();
    }
}
