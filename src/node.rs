use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config;
use crate::config::Mode;
use crate::dispatch::Dispatcher;
use crate::frame::Framer;
use crate::handler::{with_reserved, Handler};
use crate::record::Record;
use crate::registry::Registry;
use crate::statistics::{Snapshot, Statistics};
use crate::transport::{self, Shared};

/// A single runtime instance: a capability handle that is a server or a
/// client depending on which of [`Node::server`]/[`Node::client`] is
/// called, and addresses peers by UID from either role. Every setter and
/// lifecycle method takes `&self`, so the handle is meant to live behind an
/// `Arc` and be shared across the tasks that configure, run, and drive it.
///
/// Setters have effect only before [`Node::server`]/[`Node::client`] is
/// called; calling one afterwards changes state that a already-started
/// runtime never rereads.
pub struct Node {
    uid: Mutex<Option<String>>,
    pack_header: Mutex<String>,
    api_queue: Mutex<usize>,
    conn_queue: Mutex<usize>,
    conn_buffer: Mutex<usize>,
    timeout: Mutex<Option<Duration>>,
    handlers: Mutex<Option<AHashMap<String, Handler>>>,
    mode: Mutex<Option<Mode>>,
    registry: Arc<Registry>,
    shared: Mutex<Option<Arc<Shared>>>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            uid: Mutex::new(None),
            pack_header: Mutex::new(config::DEFAULT_HEADER.to_string()),
            api_queue: Mutex::new(config::DEFAULT_API_QUEUE),
            conn_queue: Mutex::new(config::DEFAULT_CONN_QUEUE),
            conn_buffer: Mutex::new(config::DEFAULT_CONN_BUFFER),
            timeout: Mutex::new(None),
            handlers: Mutex::new(None),
            mode: Mutex::new(None),
            registry: Arc::new(Registry::default()),
            shared: Mutex::new(None),
        }
    }
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a Node pre-seeded from a loaded [`config::Config`]'s `node`
    /// section; the handler table still has to be installed separately via
    /// [`Node::set_api`].
    pub fn from_config(cfg: &config::Node) -> Self {
        let node = Self::default();
        if let Some(uid) = &cfg.uid {
            *node.uid.lock() = Some(uid.clone());
        }
        *node.pack_header.lock() = cfg.pack_header.clone();
        *node.api_queue.lock() = cfg.api_queue;
        *node.conn_queue.lock() = cfg.conn_queue;
        *node.conn_buffer.lock() = cfg.conn_buffer;
        *node.timeout.lock() = Some(cfg.timeout());
        node
    }

    pub fn set_uid(&self, uid: impl Into<String>) -> &Self {
        *self.uid.lock() = Some(uid.into());
        self
    }

    pub fn set_pack_header(&self, header: impl Into<String>) -> &Self {
        *self.pack_header.lock() = header.into();
        self
    }

    pub fn set_api_queue(&self, capacity: usize) -> &Self {
        *self.api_queue.lock() = capacity;
        self
    }

    pub fn set_conn_queue(&self, capacity: usize) -> &Self {
        *self.conn_queue.lock() = capacity;
        self
    }

    pub fn set_conn_buffer(&self, size: usize) -> &Self {
        *self.conn_buffer.lock() = size;
        self
    }

    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        *self.timeout.lock() = Some(timeout);
        self
    }

    /// Installs the handler table; the reserved `IDENTITY`/`HEARTBEAT`
    /// entries are injected over any user value at those keys once the
    /// node starts.
    pub fn set_api(&self, table: AHashMap<String, Handler>) -> &Self {
        *self.handlers.lock() = Some(table);
        self
    }

    pub fn get_mode(&self) -> Option<Mode> {
        *self.mode.lock()
    }

    pub fn count_nodes(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self, addr: &SocketAddr) -> Option<Snapshot> {
        self.shared.lock().as_ref().and_then(|s| s.statistics.snapshot(addr))
    }

    fn build_shared(&self, mode: Mode, default_timeout: Duration) -> Result<Arc<Shared>> {
        let Some(handlers) = self.handlers.lock().take() else {
            log::error!("set_api must be called before server/client");
            bail!("set_api must be called before server/client");
        };

        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel::<Record>(*self.api_queue.lock());
        let shared = Arc::new(Shared {
            registry: self.registry.clone(),
            framer: Framer::new(self.pack_header.lock().as_bytes().to_vec()),
            handlers: with_reserved(handlers),
            inbound_tx,
            uid: self.uid.lock().clone(),
            conn_queue: *self.conn_queue.lock(),
            conn_buffer: *self.conn_buffer.lock(),
            timeout: self.timeout.lock().unwrap_or(default_timeout),
            statistics: Statistics::default(),
            mode,
        });

        *self.mode.lock() = Some(mode);
        *self.shared.lock() = Some(shared.clone());

        let dispatcher = Arc::new(Dispatcher::new(shared.registry.clone(), shared.handlers.clone()));
        tokio::spawn(dispatcher.run(inbound_rx));

        Ok(shared)
    }

    /// Starts this node as a server, accepting inbound connections on
    /// `port` until the process exits.
    pub async fn server(&self, port: u16) -> Result<()> {
        let shared = self.build_shared(Mode::Server, Duration::from_secs(config::DEFAULT_SERVER_TIMEOUT_SECS))?;
        transport::serve(shared, port).await
    }

    /// Starts this node as a client, dialing `server_addr` and reconnecting
    /// indefinitely across failures or disconnects.
    pub async fn client(&self, server_addr: SocketAddr) -> Result<()> {
        let shared = self.build_shared(Mode::Client, Duration::from_secs(config::DEFAULT_CLIENT_TIMEOUT_SECS))?;
        transport::connect(shared, server_addr).await
    }

    /// Enqueues `body` under `operation` for delivery and returns once it
    /// is handed to a connection's outbox. If `uid` is omitted, blocks
    /// until any connection exists and picks one of them; otherwise blocks
    /// until the named UID resolves. Delivery itself is fire-and-forget.
    pub async fn request(&self, body: Value, operation: impl Into<String>, uid: Option<&str>) {
        let operation = operation.into();
        let conn = match uid {
            Some(uid) => self.registry.lookup_by_uid(uid).await,
            None => self.registry.pick_any().await,
        };

        let record = Record {
            from: conn.local_addr.to_string(),
            to: conn.remote_addr.to_string(),
            operation,
            body,
        };

        if let Err(err) = conn.enqueue(record).await {
            log::warn!("request: failed to enqueue record: {err}");
        }
    }
}
