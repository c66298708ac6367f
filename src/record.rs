use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake operation: body carries the sender's UID.
pub const IDENTITY: &str = "+|+";

/// Client-originated liveness keep-alive; body is an opaque counter.
pub const HEARTBEAT: &str = "-|-";

/// The unit of exchange between nodes.
///
/// Field names are capitalized on the wire (`From`/`To`/`Operation`/`Body`)
/// to match the framing protocol's JSON payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Operation")]
    pub operation: String,
    #[serde(rename = "Body", default)]
    pub body: Value,
}

impl Record {
    /// Builds a record with empty `from`/`to`; callers addressing a request
    /// (or the dispatcher addressing a reply) fill those in afterwards.
    pub fn new(operation: impl Into<String>, body: Value) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            operation: operation.into(),
            body,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.operation == IDENTITY
    }

    pub fn is_heartbeat(&self) -> bool {
        self.operation == HEARTBEAT
    }
}
