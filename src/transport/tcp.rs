//! TCP transport with a length-prefixed frame envelope.
//!
//! A message on the wire is a little-endian u32 frame count followed by
//! each frame as a u32 length and its bytes. Streams are tuned for low
//! latency (nodelay, fixed buffer sizes). The server endpoint keeps
//! accepting after a session ends, so a channel assigned with the
//! reconnect flag can host sequential clients.

use super::{
    ChannelEndpoint, ConnectEvents, ConnectStatus, DataReceive, DataSend, EndpointCore,
    EndpointHandle, TransportProvider,
};
use crate::config;
use crate::wire::FrameSeq;
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Printable name embedded in connection strings.
pub const PROVIDER_NAME: &str = "Tcp";

/// Upper bound for a single frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound for the frame count of one message.
const MAX_FRAME_COUNT: u32 = 4096;

/// Socket buffer size applied to both directions.
const SOCKET_BUFFER_SIZE: usize = 8192;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

fn write_frames(stream: &mut TcpStream, frames: &FrameSeq) -> io::Result<()> {
    stream.write_u32::<LittleEndian>(frames.len() as u32)?;
    for frame in frames {
        stream.write_u32::<LittleEndian>(frame.len() as u32)?;
        stream.write_all(frame)?;
    }
    stream.flush()
}

fn read_frames(stream: &mut TcpStream) -> io::Result<FrameSeq> {
    let count = stream.read_u32::<LittleEndian>()?;
    if count > MAX_FRAME_COUNT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message with {count} frames"),
        ));
    }
    let mut frames = FrameSeq::new();
    for _ in 0..count {
        let length = stream.read_u32::<LittleEndian>()? as usize;
        if length > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {length} bytes"),
            ));
        }
        let mut frame = vec![0u8; length];
        io::Read::read_exact(stream, &mut frame)?;
        frames.push_back(frame);
    }
    Ok(frames)
}

/// Configure a stream for low latency.
fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    let socket = socket2::Socket::from(stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(())
}

struct TcpSendHalf {
    stream: Mutex<Option<TcpStream>>,
}

impl DataSend for TcpSendHalf {
    fn send_data(&self, frames: FrameSeq) -> bool {
        let mut guard = self.stream.lock();
        match guard.as_mut() {
            Some(stream) => match write_frames(stream, &frames) {
                Ok(()) => true,
                Err(error) => {
                    debug!("tcp send failed: {error}");
                    *guard = None;
                    false
                }
            },
            None => false,
        }
    }
}

/// Read messages until the stream fails or the endpoint closes.
fn session_loop(core: &EndpointCore, stream: &mut TcpStream) {
    loop {
        if core.is_closed() {
            break;
        }
        match read_frames(stream) {
            Ok(mut frames) => match core.receive() {
                Some(receive) => receive.receive_data(&mut frames),
                None => break,
            },
            Err(error) => {
                debug!("tcp session ended: {error}");
                break;
            }
        }
    }
}

struct TcpServerEndpoint {
    core: Arc<EndpointCore>,
    listener: Mutex<Option<TcpListener>>,
    send: Arc<TcpSendHalf>,
    accepting: AtomicBool,
}

impl ChannelEndpoint for TcpServerEndpoint {
    fn sender(&self) -> Option<Arc<dyn DataSend>> {
        Some(self.send.clone())
    }

    fn async_connect(&self, receive: Arc<dyn DataReceive>) -> bool {
        if self.core.is_closed() {
            return false;
        }
        self.core.set_receive(receive);
        if self.accepting.swap(true, Ordering::SeqCst) {
            return true;
        }
        let listener = match self.listener.lock().take() {
            Some(listener) => listener,
            None => return false,
        };
        if listener.set_nonblocking(true).is_err() {
            return false;
        }

        let core = self.core.clone();
        let send = self.send.clone();
        thread::spawn(move || loop {
            if core.is_closed() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("tcp server accepted {peer}");
                    if stream.set_nonblocking(false).is_err() || tune_stream(&stream).is_err() {
                        continue;
                    }
                    let write_half = match stream.try_clone() {
                        Ok(write_half) => write_half,
                        Err(_) => continue,
                    };
                    *send.stream.lock() = Some(write_half);
                    core.set_status(ConnectStatus::Connected);

                    let mut stream = stream;
                    session_loop(&core, &mut stream);

                    *send.stream.lock() = None;
                    core.set_status(ConnectStatus::Disconnected);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(error) => {
                    debug!("tcp accept failed: {error}");
                    break;
                }
            }
        });
        true
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.core.wait_for_connection(timeout)
    }

    fn disconnect(&self) {
        self.core.close();
        self.core.clear_receive();
        if let Some(stream) = self.send.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        *self.listener.lock() = None;
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

struct TcpClientEndpoint {
    core: Arc<EndpointCore>,
    address: String,
    send: Arc<TcpSendHalf>,
}

impl ChannelEndpoint for TcpClientEndpoint {
    fn sender(&self) -> Option<Arc<dyn DataSend>> {
        Some(self.send.clone())
    }

    fn async_connect(&self, receive: Arc<dyn DataReceive>) -> bool {
        if self.core.is_closed() {
            return false;
        }
        self.core.set_receive(receive);

        let core = self.core.clone();
        let send = self.send.clone();
        let address = self.address.clone();
        thread::spawn(move || {
            let stream = match TcpStream::connect(&address) {
                Ok(stream) => stream,
                Err(error) => {
                    debug!("tcp connect to {address} failed: {error}");
                    core.set_status(ConnectStatus::Disconnected);
                    return;
                }
            };
            if tune_stream(&stream).is_err() {
                core.set_status(ConnectStatus::Disconnected);
                return;
            }
            let write_half = match stream.try_clone() {
                Ok(write_half) => write_half,
                Err(_) => {
                    core.set_status(ConnectStatus::Disconnected);
                    return;
                }
            };
            *send.stream.lock() = Some(write_half);
            core.set_status(ConnectStatus::Connected);

            let mut stream = stream;
            session_loop(&core, &mut stream);

            *send.stream.lock() = None;
            core.set_status(ConnectStatus::Disconnected);
        });
        true
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.core.wait_for_connection(timeout)
    }

    fn disconnect(&self) {
        self.core.close();
        self.core.clear_receive();
        if let Some(stream) = self.send.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
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

/// Provider for TCP channels.
pub struct TcpTransport;

impl TransportProvider for TcpTransport {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn create_endpoint(&self, config: &str) -> Result<EndpointHandle> {
        let settings = config::parse_endpoint(config)?;
        let host = settings
            .interface
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = settings.port.unwrap_or(0);

        let listener = TcpListener::bind((host.as_str(), port))
            .with_context(|| format!("could not bind {host}:{port}"))?;
        let local = listener.local_addr()?;
        debug!("tcp server listening on {local}");

        let endpoint = Arc::new(TcpServerEndpoint {
            core: Arc::new(EndpointCore::new()),
            listener: Mutex::new(Some(listener)),
            send: Arc::new(TcpSendHalf {
                stream: Mutex::new(None),
            }),
            accepting: AtomicBool::new(false),
        });
        let connect_string = format!(
            "[Provider]\nName = \"{PROVIDER_NAME}\"\n\n[IpcChannel]\nInterface = \"{host}\"\nPort = {}\n",
            local.port()
        );
        Ok(EndpointHandle {
            endpoint,
            connect_string,
        })
    }

    fn access(&self, connect_string: &str) -> Result<Arc<dyn ChannelEndpoint>> {
        let settings = config::parse_endpoint(connect_string)?;
        let host = settings
            .interface
            .context("tcp connection string names no interface")?;
        let port = settings
            .port
            .context("tcp connection string names no port")?;
        Ok(Arc::new(TcpClientEndpoint {
            core: Arc::new(EndpointCore::new()),
            address: format!("{host}:{port}"),
            send: Arc::new(TcpSendHalf {
                stream: Mutex::new(None),
            }),
        }))
    }
}
