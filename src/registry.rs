use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::time::sleep;

use crate::connection::Connection;

const UID_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ANY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Inner {
    conn_by_addr: AHashMap<SocketAddr, Arc<Connection>>,
    addr_by_uid: AHashMap<String, SocketAddr>,
}

/// Address→Connection and UID→Address maps under one lock domain.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner.write().conn_by_addr.insert(conn.remote_addr, conn);
    }

    pub fn bind_uid(&self, uid: impl Into<String>, addr: SocketAddr) {
        self.inner.write().addr_by_uid.insert(uid.into(), addr);
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.inner.read().conn_by_addr.get(addr).cloned()
    }

    /// Polls every 50ms until `uid` resolves to a live connection.
    pub async fn lookup_by_uid(&self, uid: &str) -> Arc<Connection> {
        loop {
            let found = {
                let inner = self.inner.read();
                inner
                    .addr_by_uid
                    .get(uid)
                    .and_then(|addr| inner.conn_by_addr.get(addr).cloned())
            };
            if let Some(conn) = found {
                return conn;
            }
            sleep(UID_POLL_INTERVAL).await;
        }
    }

    /// Polls every 500ms until at least one connection exists, then returns
    /// an arbitrary one of them.
    pub async fn pick_any(&self) -> Arc<Connection> {
        loop {
            let found = self.inner.read().conn_by_addr.values().next().cloned();
            if let Some(conn) = found {
                return conn;
            }
            sleep(ANY_POLL_INTERVAL).await;
        }
    }

    /// Removes `addr` from both maps and closes its connection handle.
    /// Idempotent: a second call on an already-removed address is a no-op.
    pub fn remove(&self, addr: &SocketAddr) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.conn_by_addr.remove(addr) {
            conn.close();
        }
        inner.addr_by_uid.retain(|_, bound| bound != addr);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().conn_by_addr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().conn_by_addr.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(addr: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(addr.parse().unwrap(), "127.0.0.1:1".parse().unwrap(), tx))
    }

    #[test]
    fn insert_lookup_and_remove() {
        let registry = Registry::default();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        registry.insert(conn("127.0.0.1:9001"));
        assert!(registry.lookup(&addr).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(&addr);
        assert!(registry.lookup(&addr).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_an_address_drops_its_uid_binding() {
        let registry = Registry::default();
        let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        registry.insert(conn("127.0.0.1:9002"));
        registry.bind_uid("peer-1", addr);

        registry.remove(&addr);
        assert!(registry.inner.read().addr_by_uid.get("peer-1").is_none());
    }

    #[test]
    fn remove_on_unknown_address_is_a_harmless_no_op() {
        let registry = Registry::default();
        registry.remove(&"127.0.0.1:1".parse().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_by_uid_resolves_once_the_binding_appears() {
        let registry = Arc::new(Registry::default());
        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.lookup_by_uid("peer-2").await.remote_addr })
        };

        tokio::time::advance(Duration::from_millis(120)).await;
        registry.insert(conn("127.0.0.1:9003"));
        registry.bind_uid("peer-2", addr);

        let resolved = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
        assert_eq!(resolved, addr);
    }
}
