//! The space/index metadata cache.
//!
//! Snapshots are immutable and published with a single atomic swap: readers
//! never block on a writer, and a writer only ever replaces the whole
//! value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::SchemaError;
use crate::request::{IndexRef, SchemaResolver, SpaceRef};

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

#[derive(Debug, Clone)]
pub struct KeyPart {
    pub field: u32,
    pub field_type: String,
    pub collation: Option<String>,
    pub is_nullable: bool,
}

#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub unique: bool,
    pub parts: Vec<KeyPart>,
}

#[derive(Debug, Clone)]
pub struct SpaceRecord {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub fields: Vec<FieldDef>,
    pub indexes_by_name: HashMap<String, u32>,
    pub indexes_by_id: HashMap<u32, IndexRecord>,
}

impl SpaceRecord {
    pub fn index(&self, r: &IndexRef) -> Option<&IndexRecord> {
        match r {
            IndexRef::Id(id) => self.indexes_by_id.get(id),
            IndexRef::Name(name) => self
                .indexes_by_name
                .get(name)
                .and_then(|id| self.indexes_by_id.get(id)),
        }
    }
}

/// An immutable point-in-time view of the server's spaces and indexes.
#[derive(Debug)]
pub struct SchemaSnapshot {
    pub version: u64,
    pub spaces_by_name: HashMap<String, Arc<SpaceRecord>>,
    pub spaces_by_id: HashMap<u32, Arc<SpaceRecord>>,
}

impl SchemaSnapshot {
    pub fn empty() -> SchemaSnapshot {
        SchemaSnapshot {
            version: 0,
            spaces_by_name: HashMap::new(),
            spaces_by_id: HashMap::new(),
        }
    }

    fn space(&self, r: &SpaceRef) -> Option<&Arc<SpaceRecord>> {
        match r {
            SpaceRef::Id(id) => self.spaces_by_id.get(id),
            SpaceRef::Name(name) => self.spaces_by_name.get(name),
        }
    }
}

/// A held permit entitling the caller to perform the one refresh everyone
/// else is waiting on. Dropping it (e.g. on an error path) releases the
/// refresh lock for the next caller to try again.
pub struct RefreshPermit<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

pub struct SchemaCache {
    snapshot: ArcSwapOption<SchemaSnapshot>,
    refresh_lock: AsyncMutex<()>,
    observed_version: std::sync::atomic::AtomicU64,
    peer_supports_names: AtomicBool,
}

impl SchemaCache {
    pub fn new() -> SchemaCache {
        SchemaCache {
            snapshot: ArcSwapOption::from(None),
            refresh_lock: AsyncMutex::new(()),
            observed_version: std::sync::atomic::AtomicU64::new(0),
            peer_supports_names: AtomicBool::new(false),
        }
    }

    pub fn set_peer_supports_names(&self, supported: bool) {
        self.peer_supports_names.store(supported, Ordering::Relaxed);
    }

    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.load_full()
    }

    /// Numeric ids resolve with no cache dependency regardless of snapshot
    /// state; names require both peer support and a populated snapshot.
    pub fn resolve_space(&self, r: &SpaceRef) -> Result<u32, SchemaError> {
        if let SpaceRef::Id(id) = r {
            return Ok(*id);
        }
        if !self.peer_supports_names.load(Ordering::Relaxed) {
            return Err(SchemaError::NameUnsupported);
        }
        let snapshot = self.snapshot.load();
        let snapshot = snapshot.as_ref().ok_or_else(|| name_err(r))?;
        snapshot
            .space(r)
            .map(|s| s.id)
            .ok_or_else(|| name_err(r))
    }

    pub fn resolve_index(&self, r: &IndexRef, space_id: u32) -> Result<u32, SchemaError> {
        if let IndexRef::Id(id) = r {
            return Ok(*id);
        }
        if !self.peer_supports_names.load(Ordering::Relaxed) {
            return Err(SchemaError::NameUnsupported);
        }
        let snapshot = self.snapshot.load();
        let snapshot = snapshot.as_ref().ok_or_else(|| index_err(r))?;
        let space = snapshot
            .spaces_by_id
            .get(&space_id)
            .ok_or_else(|| index_err(r))?;
        space.index(r).map(|i| i.id).ok_or_else(|| index_err(r))
    }

    /// Called by the reader loop when a response header carries a schema
    /// version different from the last one seen. Invalidation itself is
    /// deferred — the snapshot is simply dropped, and the next resolve call
    /// pays for a real refresh.
    pub fn mark_stale_if_newer(&self, reported_version: u64) {
        let prev = self.observed_version.swap(reported_version, Ordering::AcqRel);
        if reported_version != prev {
            self.snapshot.store(None);
        }
    }

    /// Try to become the single caller that performs the on-wire refresh.
    /// Returns `None` if a refresh already landed while the caller was
    /// waiting for the lock (so nothing further needs doing) and `Some` with
    /// a permit otherwise. Concurrent callers all converge on the same
    /// `tokio::sync::Mutex`, so only one ever observes `Some`.
    pub async fn begin_refresh(&self) -> Option<RefreshPermit<'_>> {
        let guard = self.refresh_lock.lock().await;
        if self.snapshot.load().is_some() {
            return None;
        }
        Some(RefreshPermit { _guard: guard })
    }

    pub fn install(&self, snapshot: SchemaSnapshot) {
        self.snapshot.store(Some(Arc::new(snapshot)));
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

fn name_err(r: &SpaceRef) -> SchemaError {
    match r {
        SpaceRef::Name(n) => SchemaError::UnknownSpace(n.clone()),
        SpaceRef::Id(_) => unreachable!("numeric space refs never fail resolution"),
    }
}

fn index_err(r: &IndexRef) -> SchemaError {
    match r {
        IndexRef::Name(n) => SchemaError::UnknownIndex(n.clone()),
        IndexRef::Id(_) => unreachable!("numeric index refs never fail resolution"),
    }
}

/// Adapter handed to [`crate::request::Request::encode_body`] implementors;
/// wraps a `SchemaCache` reference plus the negotiated name-support bit.
pub struct Resolver<'a> {
    pub cache: &'a SchemaCache,
}

impl SchemaResolver for Resolver<'_> {
    fn resolve_space(&self, space: &SpaceRef) -> Result<u32, SchemaError> {
        self.cache.resolve_space(space)
    }

    fn resolve_index(&self, index: &IndexRef, space_id: u32) -> Result<u32, SchemaError> {
        self.cache.resolve_index(index, space_id)
    }

    fn peer_supports_names(&self) -> bool {
        self.cache.peer_supports_names.load(Ordering::Relaxed)
    }
}
