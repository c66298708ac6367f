use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Notify};

use crate::record::Record;

/// One registered TCP endpoint: the Registry's unit of identity.
///
/// The socket's read/write halves live in the reader/writer tasks, not
/// here; this handle only carries what the Registry and Dispatcher need to
/// address and tear down a connection.
pub struct Connection {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    outbox_tx: mpsc::Sender<Record>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, local_addr: SocketAddr, outbox_tx: mpsc::Sender<Record>) -> Self {
        Self {
            remote_addr,
            local_addr,
            outbox_tx,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Appends to the outbox; blocks (asynchronously) while the outbox is
    /// full and fails once the writer task has exited.
    pub async fn enqueue(&self, record: Record) -> Result<()> {
        self.outbox_tx
            .send(record)
            .await
            .map_err(|_| anyhow!("connection {} is closed", self.remote_addr))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent; wakes the reader and writer tasks so both exit promptly.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
        }
    }

    /// `notify_waiters` wakes only waiters already registered when it runs, so
    /// the `Notified` future must exist before the flag check below — checking
    /// first and constructing the future after would let a `close()` in
    /// between the two steps vanish with no one left to observe it.
    pub async fn closed_signal(&self) {
        let notified = self.shutdown.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}
