//! A peer-symmetric RPC runtime: any process can act as a server or an
//! auto-reconnecting client over a persistent, length-prefixed TCP stream,
//! and either side may address a request to the other by a stable node UID.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod node;
pub mod record;
pub mod registry;
pub mod statistics;
pub mod transport;

use std::sync::Arc;

use anyhow::Result;

pub use config::Config;
pub use handler::{handler as make_handler, Handler, HandlerTable};
pub use node::Node;
pub use record::Record;

/// Builds a [`Node`] from a loaded [`Config`], installs `handlers`, and
/// starts it in the configured mode. Runs until the process exits.
pub async fn startup(config: Arc<Config>, handlers: ahash::AHashMap<String, Handler>) -> Result<()> {
    let node = Node::from_config(&config.node);
    node.set_api(handlers);

    match config.node.mode {
        config::Mode::Server => node.server(config.node.port).await,
        config::Mode::Client => node.client(config.node.server_addr).await,
    }
}
