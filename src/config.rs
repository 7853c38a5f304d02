//! TOML configuration blocks consumed by the connection broker and the
//! transports.
//!
//! Connection strings are small TOML documents as well; the only field the
//! core itself interprets is `Provider.Name`, which selects the transport
//! provider. Everything else inside a connection string belongs to the
//! transport that emitted it.

use crate::transport::ChannelKind;
use anyhow::{Context, Result};
use serde::Deserialize;

/// `[Listener]` block configuring the connection listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerSettings {
    #[serde(rename = "Type")]
    pub kind: ChannelKind,
    /// Local listeners only; defaults to an identifier derived from the
    /// hosting process.
    #[serde(default)]
    pub instance: Option<u32>,
    /// Remote listeners only.
    #[serde(default)]
    pub interface: Option<String>,
    /// Remote listeners only.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Deserialize)]
struct ListenerDocument {
    #[serde(rename = "Listener")]
    listener: ListenerSettings,
}

/// `[Client]` block configuring the rendezvous client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientSettings {
    #[serde(rename = "Type", default = "default_kind")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub instance: Option<u32>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Deserialize)]
struct ClientDocument {
    #[serde(rename = "Client")]
    client: ClientSettings,
}

/// `[IpcChannel]` block handed to a transport when creating or accessing
/// an endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointSettings {
    pub name: Option<String>,
    pub size: Option<u32>,
    pub interface: Option<String>,
    pub port: Option<u16>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct EndpointDocument {
    #[serde(rename = "IpcChannel")]
    ipc_channel: EndpointSettings,
}

fn default_kind() -> ChannelKind {
    ChannelKind::Local
}

/// Instance identifier used when a local configuration does not name one.
pub fn default_instance() -> u32 {
    std::process::id()
}

pub fn parse_listener(text: &str) -> Result<ListenerSettings> {
    let document: ListenerDocument =
        toml::from_str(text).context("invalid listener configuration")?;
    Ok(document.listener)
}

pub fn parse_client(text: &str) -> Result<ClientSettings> {
    let document: ClientDocument = toml::from_str(text).context("invalid client configuration")?;
    Ok(document.client)
}

pub fn parse_endpoint(text: &str) -> Result<EndpointSettings> {
    if text.trim().is_empty() {
        return Ok(EndpointSettings::default());
    }
    let document: EndpointDocument =
        toml::from_str(text).context("invalid endpoint configuration")?;
    Ok(document.ipc_channel)
}

/// Extract `Provider.Name` from a connection string.
pub fn provider_name(connect_string: &str) -> Result<String> {
    let value: toml::Value =
        toml::from_str(connect_string).context("invalid connection string")?;
    value
        .get("Provider")
        .and_then(|provider| provider.get("Name"))
        .and_then(|name| name.as_str())
        .map(|name| name.to_string())
        .context("connection string names no provider")
}
