//! Broker message shapes and the fixed queue topology.
//!
//! Two exchanges, each with one queue bound by its own name:
//!
//! ```text
//! amqp.worker      ──► worker.search   (indexing worker)
//! amqp.worker.dlq  ──► worker.dlq      (dead-letter worker)
//! ```
//!
//! Every message carries an `x-rabbit-secret` header. The indexing worker and the
//! dead-letter worker refuse to act on messages whose secret does not match.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const PRIMARY_EXCHANGE: &str = "amqp.worker";
pub const PRIMARY_QUEUE: &str = "worker.search";
pub const DEAD_LETTER_EXCHANGE: &str = "amqp.worker.dlq";
pub const DEAD_LETTER_QUEUE: &str = "worker.dlq";
pub const EXCHANGE_TYPE_DIRECT: &str = "direct";

pub const HEADER_SECRET: &str = "x-rabbit-secret";
pub const HEADER_UNKNOWN: &str = "x-rabbit-unknown";
pub const HEADER_TTL: &str = "x-message-ttl";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Collection name used for user documents.
pub const USERS_COLLECTION: &str = "users";

/// Cache key holding the change watermark.
pub const WATERMARK_KEY: &str = "WORKER:SEARCH:CDC";
/// Cache key of the poller's breaker counter.
pub const SCHEDULER_BREAK_KEY: &str = "SCHEDULER:SEARCH:BREAK";

/// A typed header value. Covers what the pipeline writes and reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Bool(bool),
    Int(i64),
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// String header. Non-string values yield `None`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(HeaderValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Boolean header. Accepts the strings "true"/"false" as well.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(HeaderValue::Bool(b)) => Some(*b),
            Some(HeaderValue::Str(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// True when the secret header is present and equals `expected`.
    #[must_use]
    pub fn secret_matches(&self, expected: &str) -> bool {
        self.get_str(HEADER_SECRET) == Some(expected)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An outgoing broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEnvelope {
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    pub headers: Headers,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl QueueEnvelope {
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        exchange_type: impl Into<String>,
        queue: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_type: exchange_type.into(),
            queue: queue.into(),
            headers: Headers::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// JSON body addressed to the primary indexing queue.
    pub fn primary<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(PRIMARY_EXCHANGE, EXCHANGE_TYPE_DIRECT, PRIMARY_QUEUE, serde_json::to_vec(body)?))
    }

    /// JSON body addressed to the dead-letter queue.
    pub fn dead_letter<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            DEAD_LETTER_EXCHANGE,
            EXCHANGE_TYPE_DIRECT,
            DEAD_LETTER_QUEUE,
            serde_json::to_vec(body)?,
        ))
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Attach the secret and TTL headers every pipeline message carries.
    #[must_use]
    pub fn signed(self, secret: &str, ttl_secs: i64) -> Self {
        self.with_header(HEADER_SECRET, secret)
            .with_header(HEADER_TTL, ttl_secs)
    }
}

/// A delivery handed to a [`crate::storage::traits::MessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub queue: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

impl From<QueueEnvelope> for IncomingMessage {
    fn from(envelope: QueueEnvelope) -> Self {
        Self {
            queue: envelope.queue,
            headers: envelope.headers,
            body: envelope.body,
            redelivered: false,
        }
    }
}

/// What the broker should do with a delivery once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    NackRequeue,
    NackDiscard,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::NackRequeue => write!(f, "nack_requeue"),
            Self::NackDiscard => write!(f, "nack_discard"),
        }
    }
}

/// Index mutation requested by an [`IndexingInstruction`].
///
/// Unrecognized strings decode to [`IndexAction::Unknown`] so that the
/// failure surfaces at dispatch (and is dead-lettered) instead of at decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndexAction {
    Insert,
    Update,
    Delete,
    Unknown(String),
}

impl IndexAction {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Unknown(s) => s.as_str(),
        }
    }
}

impl From<String> for IndexAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::Unknown(s),
        }
    }
}

impl From<IndexAction> for String {
    fn from(a: IndexAction) -> Self {
        match a {
            IndexAction::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded body of a primary-queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingInstruction {
    #[serde(default)]
    pub id: Option<String>,
    pub doc: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub is_bulk: bool,
    pub action: IndexAction,
}

impl IndexingInstruction {
    #[must_use]
    pub fn single(action: IndexAction, id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            doc: USERS_COLLECTION.to_string(),
            data,
            is_bulk: false,
            action,
        }
    }

    #[must_use]
    pub fn bulk(action: IndexAction, documents: Vec<Value>) -> Self {
        Self {
            id: None,
            doc: USERS_COLLECTION.to_string(),
            data: Value::Array(documents),
            is_bulk: true,
            action,
        }
    }

    /// Target document id: explicit `id`, else `data.id`.
    #[must_use]
    pub fn target_id(&self) -> Option<String> {
        if let Some(id) = self.id.as_deref().filter(|s| !s.is_empty()) {
            return Some(id.to_string());
        }
        match self.data.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Documents carried by the instruction. Bulk payloads are arrays, single payloads are one object.
    #[must_use]
    pub fn documents(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            single => vec![single.clone()],
        }
    }
}

/// A failed primary-queue message, enriched with the failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub unknown: bool,
    #[serde(default)]
    pub error: String,
}

impl DeadLetterRecord {
    #[must_use]
    pub fn has_payload(&self) -> bool {
        !self.body.is_null()
    }
}
