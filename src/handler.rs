use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ahash::AHashMap;

use crate::record::{Record, HEARTBEAT, IDENTITY};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A request handler: given the inbound record, returns an optional reply
/// body. Invoked concurrently, one task per inbound record.
pub type Handler = Arc<dyn Fn(Record) -> BoxFuture<Option<Record>> + Send + Sync>;

pub type HandlerTable = Arc<AHashMap<String, Handler>>;

/// Wraps a plain synchronous function as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Record) -> Option<Record> + Send + Sync + 'static,
{
    Arc::new(move |record: Record| {
        let reply = f(record);
        Box::pin(async move { reply }) as BoxFuture<Option<Record>>
    })
}

/// Installs the reserved `IDENTITY`/`HEARTBEAT` entries, overwriting any
/// user-supplied value at those keys.
pub fn with_reserved(mut table: AHashMap<String, Handler>) -> HandlerTable {
    table.insert(IDENTITY.to_string(), handler(|record| Some(Record::new(IDENTITY, record.body))));
    table.insert(HEARTBEAT.to_string(), handler(|_| None));
    Arc::new(table)
}
