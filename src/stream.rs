//! Stream id allocation and the stream handle callers use to submit
//! requests within a single ordered, optionally transactional, execution
//! context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::connection::{submit, Shared};
use crate::error::Error;
use crate::request::Request;

/// Allocates stream ids, local to one connection generation. Stream ids are
/// non-zero; zero is reserved to mean "no stream" on the wire.
pub struct StreamIdAllocator {
    next: AtomicU64,
}

impl StreamIdAllocator {
    pub fn new() -> StreamIdAllocator {
        StreamIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a server-side ordered execution context. Holds a
/// non-owning back-reference to the connection: once the connection is
/// dropped or closed, every operation on the handle fails with
/// `ConnectionClosed` instead of keeping the connection alive artificially.
#[derive(Clone)]
pub struct StreamHandle {
    id: u64,
    conn: Weak<Shared>,
}

impl StreamHandle {
    pub(crate) fn new(id: u64, conn: Weak<Shared>) -> StreamHandle {
        StreamHandle { id, conn }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Submit a request bound to this stream. The server executes
    /// stream-bound requests in submission order, within the transaction
    /// opened by a prior `BEGIN`, if any.
    pub async fn submit<R: Request>(&self, request: R) -> Result<R::Response, Error> {
        let shared = self
            .conn
            .upgrade()
            .ok_or(Error::ConnectionClosed { retryable: false })?;
        submit(&shared, request, Some(self.id)).await
    }
}
