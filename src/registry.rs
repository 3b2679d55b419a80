//! Sync id allocation and the outstanding-waiter map.
//!
//! A flat map keyed by the sync id the wire protocol assigns meaning to,
//! guarded by a single mutex whose critical sections never hold the lock
//! across an `.await`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use fnv::FnvHashMap;
use tokio::sync::oneshot;

use crate::error::Error;

/// Returned when the sync counter for this connection generation has been
/// exhausted. Wrapping is prohibited; the caller must reconnect (bumping
/// the generation) to get a fresh counter.
#[derive(Debug)]
pub struct SyncSpaceExhausted;

struct Waiter {
    tx: oneshot::Sender<Result<Bytes, Error>>,
    idempotent: bool,
}

/// Allocates sync ids and tracks outstanding waiters for one connection
/// generation. A new `RequestRegistry` is created each time the supervisor
/// establishes a fresh generation.
pub struct RequestRegistry {
    next_sync: AtomicU32,
    waiters: Mutex<FnvHashMap<u32, Waiter>>,
    /// Partial bodies accumulated for a sync that has received one or more
    /// `IPROTO_CHUNK` frames but not yet its terminating response.
    chunks: Mutex<FnvHashMap<u32, Vec<Bytes>>>,
}

impl RequestRegistry {
    pub fn new() -> RequestRegistry {
        // Sync 0 is reserved (never assigned) so it can be used as a
        // sentinel in tests and logs.
        RequestRegistry {
            next_sync: AtomicU32::new(1),
            waiters: Mutex::new(FnvHashMap::default()),
            chunks: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Stash a partial body for `sync`; it stays pending until the
    /// terminating (non-chunk) frame for the same sync arrives.
    pub fn append_chunk(&self, sync: u32, body: Bytes) {
        self.chunks.lock().unwrap().entry(sync).or_default().push(body);
    }

    /// Drain any chunks accumulated for `sync`, oldest first.
    pub fn take_chunks(&self, sync: u32) -> Vec<Bytes> {
        self.chunks.lock().unwrap().remove(&sync).unwrap_or_default()
    }

    /// Allocate the next strictly increasing sync id.
    pub fn alloc_sync(&self) -> Result<u32, SyncSpaceExhausted> {
        let sync = self.next_sync.fetch_add(1, Ordering::Relaxed);
        if sync == u32::MAX {
            return Err(SyncSpaceExhausted);
        }
        Ok(sync)
    }

    /// Register a waiter for `sync`, returning the receiving half of its
    /// completion channel. Invariant: at most one live waiter per sync per
    /// generation — callers only ever pass a sync just returned by
    /// [`alloc_sync`], so this cannot collide.
    pub fn register(&self, sync: u32, idempotent: bool) -> oneshot::Receiver<Result<Bytes, Error>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        waiters.insert(sync, Waiter { tx, idempotent });
        rx
    }

    /// Deliver a response body (or error) to the waiter for `sync`, if one
    /// is still live. Returns `false` if the sync was unknown — the caller
    /// should treat that as an unsolicited response.
    pub fn complete(&self, sync: u32, result: Result<Bytes, Error>) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.remove(&sync)
        };
        match waiter {
            Some(waiter) => {
                // The receiver may have been dropped (caller cancelled); a
                // send error here just means the response is discarded.
                let _ = waiter.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove the waiter for `sync` without completing it — used both for
    /// explicit cancellation and for deadline expiry, where the `submit`
    /// future itself already observed the failure via a racing timer.
    pub fn cancel(&self, sync: u32) {
        self.waiters.lock().unwrap().remove(&sync);
        self.chunks.lock().unwrap().remove(&sync);
    }

    /// Fail every outstanding waiter, as happens on shutdown or when a
    /// generation is torn down for reconnect. `transient` is true only for
    /// a reconnect (as opposed to a user abort or exhausted retries); a
    /// waiter whose request was marked idempotent is told it is retryable
    /// only when the shutdown is itself transient.
    pub fn fail_all(&self, transient: bool) {
        let waiters: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let retryable = transient && waiter.idempotent;
            let _ = waiter.tx.send(Err(Error::ConnectionClosed { retryable }));
        }
        self.chunks.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
