//! Newline-delimited JSON-RPC 2.0 framing and request correlation.
//!
//! Outbound messages are single-line JSON objects terminated by `\n`.
//! Inbound bytes are parsed at each newline boundary. Requests are paired to
//! responses by id through single-shot completion slots; server-initiated
//! notifications carry a `method` and no `id` and are routed to their
//! subscription channels by the session read loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::oneshot;

use crate::error::{RequestError, TransportError};

/// Hard per-message limit. A server pushing more than this per frame is
/// broken or hostile and the session is terminated.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Notification method for header tip changes.
pub const METHOD_HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
/// Notification method for scripthash status changes.
pub const METHOD_SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";

/// An outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Session-monotonic request id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    pub params: Value,
}

impl Request {
    /// Builds a request. `params` must serialize to a JSON array.
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Request {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// One frame: compact JSON plus the terminating newline.
    pub fn to_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

/// Error object in a JSON-RPC response. Some servers reply with a bare
/// string instead of the standard object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorObject {
    /// Standard `{code, message}` shape.
    Shaped {
        /// JSON-RPC error code.
        code: i64,
        /// Human readable message.
        message: String,
    },
    /// Bare message string.
    Bare(String),
}

impl ErrorObject {
    /// Normalizes into the typed request error.
    pub fn into_request_error(self) -> RequestError {
        match self {
            ErrorObject::Shaped { code, message } => RequestError::Server { code, message },
            ErrorObject::Bare(message) => RequestError::Server { code: 0, message },
        }
    }
}

/// Any message the server sends: a response to one of our requests or a
/// subscription notification.
#[derive(Debug, Deserialize)]
pub struct Inbound {
    /// Present on responses, absent on notifications.
    pub id: Option<u64>,
    /// Present on notifications.
    pub method: Option<String>,
    /// Notification payload.
    pub params: Option<Value>,
    /// Response payload.
    pub result: Option<Value>,
    /// Response error.
    pub error: Option<ErrorObject>,
}

/// What one parsed frame means to the session.
#[derive(Debug)]
pub enum Frame {
    /// Response correlated by id.
    Response {
        /// The id of the request this answers.
        id: u64,
        /// Result or server error.
        outcome: Result<Value, RequestError>,
    },
    /// Server-initiated notification.
    Notification {
        /// Subscription method name.
        method: String,
        /// Raw positional params.
        params: Value,
    },
}

/// Parses one newline-terminated frame.
pub fn parse_frame(line: &[u8]) -> Result<Frame, TransportError> {
    let inbound: Inbound = serde_json::from_slice(line)?;
    match (inbound.id, inbound.method) {
        (Some(id), _) => {
            let outcome = match (inbound.error, inbound.result) {
                (Some(err), _) => Err(err.into_request_error()),
                (None, Some(result)) => Ok(result),
                // a response with neither field is a null result
                (None, None) => Ok(Value::Null),
            };
            Ok(Frame::Response { id, outcome })
        }
        (None, Some(method)) => Ok(Frame::Notification {
            method,
            params: inbound.params.unwrap_or(Value::Null),
        }),
        (None, None) => Err(TransportError::Framing(serde::de::Error::custom(
            "message has neither id nor method",
        ))),
    }
}

/// Reads one frame into `buf`, enforcing [`MAX_FRAME_BYTES`]. Returns the
/// frame length without the newline, or 0 at clean EOF.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, TransportError>
where
    R: AsyncBufReadExt + Unpin,
{
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(0);
            }
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&chunk[..pos]);
            reader.consume(pos + 1);
            if buf.len() > MAX_FRAME_BYTES {
                return Err(TransportError::Oversize(buf.len()));
            }
            return Ok(buf.len());
        }
        buf.extend_from_slice(chunk);
        let consumed = chunk.len();
        reader.consume(consumed);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(TransportError::Oversize(buf.len()));
        }
    }
}

/// Allocates strictly monotonic request ids for one session.
#[derive(Debug, Default)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    /// Next id.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// The dispatch table: id to single-shot completion slot. Owned by the
/// session task; entries outlive the call site only until the response
/// arrives or the session ends.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: HashMap<u64, oneshot::Sender<Result<Value, RequestError>>>,
}

impl PendingRequests {
    /// Registers a slot for `id`.
    pub fn register(&mut self, id: u64) -> oneshot::Receiver<Result<Value, RequestError>> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, tx);
        rx
    }

    /// Installs a caller-provided slot for `id`.
    pub fn insert(&mut self, id: u64, slot: oneshot::Sender<Result<Value, RequestError>>) {
        self.slots.insert(id, slot);
    }

    /// Delivers a response exactly once. A response for an unknown id (for
    /// example one whose caller already timed out and was cleaned up at
    /// session end) is dropped.
    pub fn complete(&mut self, id: u64, outcome: Result<Value, RequestError>) {
        if let Some(slot) = self.slots.remove(&id) {
            // the caller may have been cancelled; delivering to no one is fine
            let _ignore_error = slot.send(outcome);
        } else {
            tracing::debug!("dropping response for unknown request id {id}");
        }
    }

    /// Fails every outstanding slot. Called when the session closes.
    pub fn fail_all(&mut self, make_error: impl Fn() -> RequestError) {
        for (_, slot) in self.slots.drain() {
            let _ignore_error = slot.send(Err(make_error()));
        }
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
