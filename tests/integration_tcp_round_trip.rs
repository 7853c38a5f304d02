//! Round trips over the TCP transport.

mod common;

use common::*;
use sdv_ipc::{ChannelKind, Client, Listener};
use std::time::Duration;

#[test]
fn simple_call_over_a_tcp_channel() {
    init_tracing();
    let server_control = control_with_tcp();
    let client_control = control_with_tcp();

    let service = HelloService::new();
    let (_server_connection, connect_string) = server_control
        .create_server_connection(ChannelKind::Remote, service.as_root(), Duration::from_secs(5))
        .unwrap();

    let (_client_connection, root) = client_control
        .create_client_connection(&connect_string, Duration::from_secs(5))
        .unwrap();

    let hello = hello_interface(&root);
    assert_eq!(hello.hello().unwrap(), "Hello");

    let returned = hello.request().unwrap();
    assert_eq!(call_hello(&returned).unwrap(), "Hello");

    client_control.shutdown();
    server_control.shutdown();
}

#[test]
fn rendezvous_works_across_tcp_sockets() {
    let server_control = control_with_tcp();
    let client_control = control_with_tcp();

    let service = HelloService::new();
    // The well-known listener port; private channels use ephemeral ports.
    let listener_config = "[Listener]\nType = \"Remote\"\nInterface = \"127.0.0.1\"\nPort = 29917\n";
    let listener = Listener::initialize(&server_control, listener_config, service.as_root())
        .unwrap();
    assert!(!listener.is_local());

    let client = Client::new(&client_control);
    let client_config = "[Client]\nType = \"Remote\"\nInterface = \"127.0.0.1\"\nPort = 29917\n";
    let (connection, root) = client.connect(client_config).unwrap();
    assert_eq!(hello_interface(&root).hello().unwrap(), "Hello");

    client.disconnect(connection);
    client.shutdown();
    listener.shutdown();
    client_control.shutdown();
    server_control.shutdown();
}
