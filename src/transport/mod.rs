use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Mode;
use crate::frame::Framer;
use crate::handler::HandlerTable;
use crate::record::Record;
use crate::registry::Registry;
use crate::statistics::Statistics;

mod tcp;

pub use tcp::{connect, serve};

/// Everything the accept/dial loops and their reader/writer tasks share.
pub(crate) struct Shared {
    pub registry: Arc<Registry>,
    pub framer: Framer,
    pub handlers: HandlerTable,
    pub inbound_tx: mpsc::Sender<Record>,
    pub uid: Option<String>,
    pub conn_queue: usize,
    pub conn_buffer: usize,
    pub timeout: Duration,
    pub statistics: Statistics,
    pub mode: Mode,
}
