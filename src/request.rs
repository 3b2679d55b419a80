//! The `Request`/`Response`/`SchemaResolver` contract external request
//! builders implement to ride the connection engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::Notify;

use crate::error::{ProtocolError, SchemaError};
use crate::frame::Opcode;

/// A cooperative cancellation signal a caller can attach to a request.
/// Cloning shares the same flag: firing it from any clone cancels every
/// `submit` still waiting on it. Independent of `Config::default_deadline`
/// — a request can carry both, neither, or just one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Fire the cancellation. Idempotent — calling it more than once has no
    /// further effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called, including if
    /// it already was before this call.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A space reference as it appears in a request body: either the caller
/// already knows the numeric id, or wants it resolved from a name through
/// the connection's [`SchemaResolver`].
#[derive(Debug, Clone)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

#[derive(Debug, Clone)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

/// Implemented by the connection engine itself; request encoders call back
/// into it to turn space/index names into numeric ids before serializing a
/// body.
pub trait SchemaResolver {
    fn resolve_space(&self, space: &SpaceRef) -> Result<u32, SchemaError>;
    fn resolve_index(&self, index: &IndexRef, space_id: u32) -> Result<u32, SchemaError>;
    /// Whether the peer supports sending names instead of ids directly,
    /// letting an encoder skip local resolution and let the server resolve.
    fn peer_supports_names(&self) -> bool;
}

/// A logical request: knows its opcode, its stream/async-ness, and how to
/// encode its own body. Implemented by request-kind crates external to this
/// one (Select, Insert, Call, …); this crate only consumes the trait.
pub trait Request: Send + Sync + 'static {
    /// The decoded shape of a successful response to this request.
    type Response: Send + 'static;

    fn opcode(&self) -> Opcode;

    /// If true, the server never replies and no waiter is allocated.
    fn is_async(&self) -> bool {
        false
    }

    /// Per-request override for `ConnectionClosed { retryable }` classification.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Stream this request is bound to, if any.
    fn stream_id(&self) -> Option<u64> {
        None
    }

    /// Per-request deadline, overriding `Config::default_deadline` when
    /// present. `None` falls back to the connection-wide default.
    fn deadline(&self) -> Option<Duration> {
        None
    }

    /// An attached cancellation token. If it fires before a response
    /// arrives, `submit` resolves with `Error::Cancelled` and the waiter is
    /// torn down without waiting for a server reply.
    fn cancellation(&self) -> Option<&CancelToken> {
        None
    }

    /// Encode the body map given a resolver for any named space/index refs.
    fn encode_body(
        &self,
        resolver: &dyn SchemaResolver,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError>;

    /// Decode a successful response body into `Self::Response`.
    fn decode_response(&self, body: &[u8]) -> Result<Self::Response, ProtocolError>;
}
