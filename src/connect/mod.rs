//! Connection broker: the two-phase rendezvous between processes.
//!
//! A listener serves a well-known channel whose only purpose is to hand
//! out per-client private channels. Each private channel is an
//! independent pipe to the served root object, so a stalled or crashed
//! client cannot disturb the listener or other clients.

pub mod client;
pub mod listener;

pub use client::Client;
pub use listener::{
    ChannelBroker, Listener, RequestChannel, RequestChannelClient, RequestChannelProxy,
    RequestChannelStub,
};
