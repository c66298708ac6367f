use std::fs::read_to_string;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_HEADER: &str = "henrylee2cn";
pub const DEFAULT_API_QUEUE: usize = 4096;
pub const DEFAULT_CONN_QUEUE: usize = 2048;
pub const DEFAULT_CONN_BUFFER: usize = 1024;
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: LogLevel::default() }
    }
}

/// Node runtime configuration, mirroring the [`crate::node::Node`] builder's
/// setters one for one.
#[derive(Debug, Deserialize)]
pub struct Node {
    /// this node's identifier on the wire.
    ///
    /// carried in the identity record exchanged right after a connection is
    /// established, and what peers address this node by from the other
    /// side. leave it unset to have each connection fall back to its own
    /// local socket address; that's fine for a handful of ad-hoc peers, but
    /// anything that needs to address a specific node by name should set
    /// one explicitly and keep it stable across restarts.
    #[serde(default)]
    pub uid: Option<String>,

    /// whether this node accepts inbound connections or dials out and
    /// reconnects.
    ///
    /// the two modes are otherwise symmetric: the same record format, the
    /// same handler table shape, the same framing. this field only picks
    /// which of [`crate::node::Node::server`]/[`crate::node::Node::client`]
    /// `startup` calls into, and which mode-specific default `timeout_secs`
    /// resolves to.
    #[serde(default = "Node::mode")]
    pub mode: Mode,

    /// server mode: the port to accept connections on.
    ///
    /// bound on `0.0.0.0`, so it accepts on every local interface. unused
    /// in client mode.
    #[serde(default = "Node::port")]
    pub port: u16,

    /// client mode: the address to dial and keep reconnecting to.
    ///
    /// a failed dial or a dropped connection is retried on a fixed interval
    /// indefinitely; there is no backoff and no limit on attempts. unused
    /// in server mode.
    #[serde(default = "Node::server_addr")]
    pub server_addr: SocketAddr,

    /// magic bytes prefixed to every frame on the wire, ahead of the
    /// length field.
    ///
    /// lets a stream resynchronize after garbage or a torn frame instead of
    /// desyncing permanently. both sides of a connection must agree on this
    /// value or every frame will fail to parse.
    #[serde(default = "Node::pack_header")]
    pub pack_header: String,

    /// capacity of the channel the dispatcher drains inbound records from.
    ///
    /// every connection's reader task feeds this single queue, so it
    /// bounds how far record delivery can lag behind the network under
    /// load before a slow reader starts exerting backpressure.
    #[serde(default = "Node::api_queue")]
    pub api_queue: usize,

    /// capacity of each connection's outbound record queue.
    ///
    /// a call to [`crate::node::Node::request`] that targets a connection
    /// whose outbox is already full will wait for room rather than drop
    /// the record or fail.
    #[serde(default = "Node::conn_queue")]
    pub conn_queue: usize,

    /// size in bytes of the read buffer used by each connection's reader
    /// task.
    ///
    /// a single `read` call never returns more than this many bytes, so a
    /// frame larger than the buffer is simply reassembled across several
    /// reads via the residue buffer; this only affects how many syscalls
    /// that reassembly costs, not what frame sizes are supported.
    #[serde(default = "Node::conn_buffer")]
    pub conn_buffer: usize,

    /// seconds; server read deadline in server mode, heartbeat interval in
    /// client mode.
    ///
    /// in server mode, a connection that sits idle past this deadline is
    /// treated as dead and torn down. in client mode, this is instead how
    /// often the writer task sends a heartbeat record to keep the
    /// server-side deadline from ever firing on a healthy connection. falls
    /// back to the mode-specific default when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Node {
    fn mode() -> Mode {
        Mode::Server
    }

    fn port() -> u16 {
        7030
    }

    fn server_addr() -> SocketAddr {
        "127.0.0.1:7030".parse().expect("valid default server address")
    }

    fn pack_header() -> String {
        DEFAULT_HEADER.to_string()
    }

    fn api_queue() -> usize {
        DEFAULT_API_QUEUE
    }

    fn conn_queue() -> usize {
        DEFAULT_CONN_QUEUE
    }

    fn conn_buffer() -> usize {
        DEFAULT_CONN_BUFFER
    }

    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_secs.unwrap_or(match self.mode {
            Mode::Server => DEFAULT_SERVER_TIMEOUT_SECS,
            Mode::Client => DEFAULT_CLIENT_TIMEOUT_SECS,
        });
        Duration::from_secs(secs)
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            uid: None,
            mode: Self::mode(),
            port: Self::port(),
            server_addr: Self::server_addr(),
            pack_header: Self::pack_header(),
            api_queue: Self::api_queue(),
            conn_queue: Self::conn_queue(),
            conn_buffer: Self::conn_buffer(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self { node: Node::default(), log: Log::default() }
    }
}

#[derive(Parser, Debug)]
#[command(about = "noderpc node", version)]
struct Cli {
    /// path to a json5 configuration file.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Parses the command line, then either reads and parses the file it
    /// names or falls back to the default configuration.
    pub fn load() -> Result<Self> {
        let Some(path) = Cli::parse().config else {
            return Ok(Self::default());
        };

        let text = read_to_string(&path).with_context(|| format!("failed to read config file {path}"))?;
        serde_json5::from_str(&text).with_context(|| format!("failed to parse config file {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.node.port, 7030);
        assert_eq!(cfg.node.pack_header, DEFAULT_HEADER);
        assert_eq!(cfg.node.timeout(), Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS));
    }

    #[test]
    fn partial_json5_fills_in_remaining_defaults() {
        let cfg: Config = serde_json5::from_str(r#"{ node: { mode: "client", server_addr: "10.0.0.5:9000" } }"#).unwrap();
        assert_eq!(cfg.node.mode, Mode::Client);
        assert_eq!(cfg.node.server_addr, "10.0.0.5:9000".parse().unwrap());
        assert_eq!(cfg.node.conn_queue, DEFAULT_CONN_QUEUE);
        assert_eq!(cfg.node.timeout(), Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS));
    }

    #[test]
    fn explicit_timeout_overrides_the_mode_default() {
        let cfg: Config = serde_json5::from_str(r#"{ node: { timeout_secs: 30 } }"#).unwrap();
        assert_eq!(cfg.node.timeout(), Duration::from_secs(30));
    }
}
