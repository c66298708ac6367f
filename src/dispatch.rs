use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::connection::Connection;
use crate::handler::HandlerTable;
use crate::record::Record;
use crate::registry::Registry;

const MISSING_CONN_RETRIES: u32 = 3;
const MISSING_CONN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Single consumer of the process-wide inbound queue. Resolves each
/// record's originating connection, looks up its handler by operation, and
/// runs the handler on its own task so a slow handler never stalls the
/// others.
pub struct Dispatcher {
    registry: Arc<Registry>,
    handlers: HandlerTable,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, handlers: HandlerTable) -> Self {
        Self { registry, handlers }
    }

    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Record>) {
        while let Some(record) = inbound.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.handle(record).await });
        }
    }

    async fn handle(&self, record: Record) {
        let Ok(from) = record.from.parse::<SocketAddr>() else {
            log::warn!("dispatch: record has an unparseable from address: {:?}", record.from);
            return;
        };

        let Some(conn) = self.resolve_connection(&from).await else {
            log::warn!("dispatch: no connection for {from} after retries, dropping record");
            return;
        };

        let Some(handler) = self.handlers.get(&record.operation).cloned() else {
            log::warn!("dispatch: illegal operation {:?} from {from}", record.operation);
            return;
        };

        let operation = record.operation.clone();
        let reply_to = record.from.clone();
        let reply_from = record.to.clone();

        if let Some(mut reply) = handler(record).await {
            if reply.operation.is_empty() {
                reply.operation = operation;
            }
            reply.from = reply_from;
            reply.to = reply_to;

            if let Err(err) = conn.enqueue(reply).await {
                log::warn!("dispatch: failed to enqueue reply to {from}: {err}");
            }
        }
    }

    async fn resolve_connection(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        for attempt in 0..=MISSING_CONN_RETRIES {
            if let Some(conn) = self.registry.lookup(addr) {
                return Some(conn);
            }
            if attempt < MISSING_CONN_RETRIES {
                sleep(MISSING_CONN_RETRY_INTERVAL).await;
            }
        }
        None
    }
}
