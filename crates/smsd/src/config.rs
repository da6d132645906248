//! The daemon's TOML configuration.
//!
//! Modules are selected explicitly with a `module` tag per entry; there is
//! no global plugin registry. A minimal configuration:
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//!
//! [[transport.services]]
//! module = "wsbridge_server"
//! http_path = "/sms/ws"
//! phone_numbers = ["+15550100"]
//! acknowledgement_timeout_secs = 5
//!
//! [transport.services.message_queue]
//! path = "/var/lib/smsd/messages.db"
//!
//! [[command.parsers]]
//! module = "slash"
//!
//! [[command.services]]
//! module = "http"
//! name = "discord"
//! url = "http://localhost:8081"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the HTTP server listens on. A bare `:port` binds all
    /// interfaces.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub command: CommandSection,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub services: Vec<TransportService>,
}

/// One transport entry, dispatched on its `module` tag.
#[derive(Debug, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum TransportService {
    /// Proxy message sends and receives over a WebSocket connection.
    Wsbridge(sms_bridge::ClientConfig),
    /// Serve the WebSocket bridge to connecting clients.
    WsbridgeServer(WsbridgeServerEntry),
}

#[derive(Debug, Deserialize)]
pub struct WsbridgeServerEntry {
    /// Where the WebSocket endpoint mounts on the daemon's HTTP server.
    pub http_path: String,
    #[serde(flatten)]
    pub service: sms_bridge::ServerConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandSection {
    #[serde(default)]
    pub parsers: Vec<ParserModule>,
    #[serde(default)]
    pub services: Vec<CommandServiceModule>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum ParserModule {
    /// `/service command args...`
    Slash,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum CommandServiceModule {
    /// A command service reached over HTTP.
    Http { name: String, url: String },
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("could not parse config {}", path.display()))
    }
}
