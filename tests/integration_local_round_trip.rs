//! End-to-end round trips over the in-process transport: two controls in
//! one process stand in for two communicating processes.

mod common;

use common::*;
use sdv_ipc::{ChannelKind, ComError};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn simple_call_over_a_local_channel() {
    init_tracing();
    let server_control = control_with_local();
    let client_control = control_with_local();

    let service = HelloService::new();
    let (_server_connection, connect_string) = server_control
        .create_server_connection(ChannelKind::Local, service.as_root(), Duration::from_secs(5))
        .unwrap();

    let (_client_connection, root) = client_control
        .create_client_connection(&connect_string, Duration::from_secs(5))
        .unwrap();

    let hello = hello_interface(&root);
    assert_eq!(hello.hello().unwrap(), "Hello");

    client_control.shutdown();
    server_control.shutdown();
}

#[test]
fn concurrent_calls_share_one_proxy_without_corruption() {
    let server_control = control_with_local();
    let client_control = control_with_local();

    let service = HelloService::new();
    let (_server_connection, connect_string) = server_control
        .create_server_connection(ChannelKind::Local, service.as_root(), Duration::from_secs(5))
        .unwrap();
    let (_client_connection, root) = client_control
        .create_client_connection(&connect_string, Duration::from_secs(5))
        .unwrap();

    let hello = hello_interface(&root);

    let greeter = {
        let hello = hello.clone();
        thread::spawn(move || {
            for _ in 0..250 {
                assert_eq!(hello.hello().unwrap(), "Hello");
            }
        })
    };
    let requester = {
        let hello = hello.clone();
        thread::spawn(move || {
            for _ in 0..250 {
                let interface = hello.request().unwrap();
                assert_eq!(call_hello(&interface).unwrap(), "Hello");
            }
        })
    };
    greeter.join().unwrap();
    requester.join().unwrap();

    client_control.shutdown();
    server_control.shutdown();
}

#[test]
fn disconnect_cancels_a_blocked_waiter() {
    let server_control = control_with_local();
    let client_control = control_with_local();

    let service = HelloService::with_delay("Hello", Duration::from_secs(2));
    let (server_connection, connect_string) = server_control
        .create_server_connection(ChannelKind::Local, service.as_root(), Duration::from_secs(5))
        .unwrap();
    let (_client_connection, root) = client_control
        .create_client_connection(&connect_string, Duration::from_secs(5))
        .unwrap();

    let hello = hello_interface(&root);
    let caller = thread::spawn(move || hello.hello());

    // Let the call reach the stalled service, then kill the channel.
    thread::sleep(Duration::from_millis(300));
    server_control.remove_connection(server_connection);

    let result = caller.join().unwrap();
    assert!(matches!(result, Err(ComError::Cancelled)));

    client_control.shutdown();
    server_control.shutdown();
}

#[test]
fn a_served_channel_without_reconnect_disappears_after_one_session() {
    let server_control = control_with_local();
    let client_control = control_with_local();

    let service = HelloService::new();
    // create_server_connection serves without the reconnect flag.
    let (_server_connection, connect_string) = server_control
        .create_server_connection(ChannelKind::Local, service.as_root(), Duration::from_secs(5))
        .unwrap();

    let (client_connection, root) = client_control
        .create_client_connection(&connect_string, Duration::from_secs(5))
        .unwrap();
    assert_eq!(hello_interface(&root).hello().unwrap(), "Hello");

    client_control.remove_connection(client_connection);

    // The server notices the hangup and removes its slot along with the
    // served endpoint; a fresh connect attempt must fail.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let attempt =
            client_control.create_client_connection(&connect_string, Duration::from_millis(500));
        match attempt {
            Err(_) => break,
            Ok((connection, _)) => {
                client_control.remove_connection(connection);
                assert!(
                    Instant::now() < deadline,
                    "channel is still accepting clients"
                );
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    client_control.shutdown();
    server_control.shutdown();
}

#[test]
fn a_served_channel_with_reconnect_accepts_a_fresh_session() {
    let server_control = control_with_local();
    let client_control = control_with_local();

    let provider = server_control.transport("Local").unwrap();
    let handle = provider
        .create_endpoint("[IpcChannel]\nName = \"ROUND_TRIP_RECONNECT\"\n")
        .unwrap();
    let service = HelloService::new();
    let server_connection = server_control
        .assign_server_endpoint(
            handle.endpoint,
            service.as_root(),
            Duration::from_secs(5),
            true,
        )
        .unwrap();

    // First session.
    let (first_connection, first_root) = client_control
        .create_client_connection(&handle.connect_string, Duration::from_secs(5))
        .unwrap();
    assert_eq!(hello_interface(&first_root).hello().unwrap(), "Hello");
    client_control.remove_connection(first_connection);

    // The slot persists; a second session gets a fresh pipe to the same
    // object. The previous session needs a moment to drain.
    let deadline = Instant::now() + Duration::from_secs(5);
    let second = loop {
        match client_control.create_client_connection(&handle.connect_string, Duration::from_secs(1))
        {
            Ok(session) => break session,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(error) => panic!("no second session: {error}"),
        }
    };
    assert_eq!(hello_interface(&second.1).hello().unwrap(), "Hello");

    // The server-side slot is still the original one.
    server_control.remove_connection(server_connection);
    client_control.shutdown();
    server_control.shutdown();
}
