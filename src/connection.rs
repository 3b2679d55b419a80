//! The supervisor: owns the connection lifecycle state machine and is the
//! type callers actually hold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::config::Config;
use crate::dialer::{self, DialedTransport};
use crate::error::{Error, SchemaError};
use crate::frame::{Header, Opcode};
use crate::reader;
use crate::registry::RequestRegistry;
use crate::request::Request;
use crate::schema::{Resolver, SchemaCache};
use crate::stream::{StreamHandle, StreamIdAllocator};
use crate::watcher::{WatcherHandler, WatcherRegistry, WatcherToken};
use crate::writer::{self, WriterCommand};

/// Coarse connection lifecycle state, observable by callers that want to
/// wait for readiness or watch for terminal closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    Reconnecting,
    Shutdown,
    Closed,
}

/// How long [`Connection::close`] waits, after the writer has flushed and
/// closed its half, for the reader loop to deliver responses already in
/// flight before force-failing whatever is still outstanding.
const CLOSE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Per-generation state: everything that is recreated each time the
/// supervisor establishes a fresh transport.
pub(crate) struct GenerationState {
    pub id: u64,
    pub registry: Arc<RequestRegistry>,
    pub writer_tx: mpsc::Sender<WriterCommand>,
    pub stream_ids: StreamIdAllocator,
    pub failed: Arc<Notify>,
}

pub(crate) struct Shared {
    config: Config,
    schema: Arc<SchemaCache>,
    watchers: Arc<WatcherRegistry>,
    state_tx: watch::Sender<ConnState>,
    generation: ArcSwapOption<GenerationState>,
    gen_counter: AtomicU64,
    closing: std::sync::atomic::AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnState) {
        self.state_tx.send_replace(state);
    }
}

/// A connection to the server. Cheaply cloneable; every clone shares the
/// same underlying generation, state, schema cache, and watcher bindings.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `config.endpoint`, complete the handshake, and spawn the
    /// background supervisor that keeps reconnecting on transport failure
    /// until [`Connection::close`] is called or retries are exhausted.
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn connect(config: Config) -> Result<Connection, Error> {
        let (state_tx, _rx) = watch::channel(ConnState::Connecting);
        let shared = Arc::new(Shared {
            schema: Arc::new(SchemaCache::new()),
            watchers: Arc::new(WatcherRegistry::new()),
            state_tx,
            generation: ArcSwapOption::from(None),
            gen_counter: AtomicU64::new(0),
            closing: std::sync::atomic::AtomicBool::new(false),
            config,
        });

        let generation = dial_and_spawn(&shared).await?;
        shared.generation.store(Some(Arc::new(generation)));
        shared.set_state(ConnState::Ready);

        tokio::spawn(supervise(shared.clone()));

        Ok(Connection { shared })
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state_tx.borrow()
    }

    /// Resolves once the connection reaches `Ready`, or returns an error if
    /// it reaches `Closed` first.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            match *rx.borrow() {
                ConnState::Ready => return Ok(()),
                ConnState::Closed => return Err(Error::ConnectionClosed { retryable: false }),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::ConnectionClosed { retryable: false });
            }
        }
    }

    /// Submit a request outside of any stream.
    pub async fn submit<R: Request>(&self, request: R) -> Result<R::Response, Error> {
        submit(&self.shared, request, None).await
    }

    /// Allocate a fresh, independent server-side ordered execution context.
    pub fn new_stream(&self) -> Result<StreamHandle, Error> {
        let generation = self
            .shared
            .generation
            .load_full()
            .ok_or(Error::ConnectionClosed { retryable: true })?;
        let id = generation.stream_ids.alloc();
        Ok(StreamHandle::new(id, Arc::downgrade(&self.shared)))
    }

    /// Subscribe to server-pushed notifications for `key`. The
    /// subscription survives reconnects; `unregister` is the only way to
    /// remove it.
    pub async fn register_watcher(
        &self,
        key: impl Into<String>,
        handler: WatcherHandler,
    ) -> Result<WatcherToken, Error> {
        let key = key.into();
        let (token, first) = self.shared.watchers.register(key.clone(), handler);
        if first {
            self.send_watch(&key).await?;
        }
        Ok(token)
    }

    pub async fn unregister_watcher(&self, token: WatcherToken) -> Result<(), Error> {
        if let Some((key, last)) = self.shared.watchers.unregister(token) {
            if last {
                self.send_unwatch(&key).await?;
            }
        }
        Ok(())
    }

    async fn send_watch(&self, key: &str) -> Result<(), Error> {
        send_key_only(&self.shared, Opcode::Watch, key).await
    }

    async fn send_unwatch(&self, key: &str) -> Result<(), Error> {
        send_key_only(&self.shared, Opcode::Unwatch, key).await
    }

    /// Gracefully close: drain the writer queue, give the reader loop a
    /// bounded chance to deliver responses already in flight on the wire,
    /// then tear the registry down. No further submissions are accepted.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.set_state(ConnState::Shutdown);
        if let Some(generation) = self.shared.generation.load_full() {
            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
            if generation.writer_tx.send(WriterCommand::Shutdown(ack_tx)).await.is_ok() {
                // Queued frames are flushed and the write half closed before
                // this resolves; only after that has the server any chance
                // to see our side finish and reply to what's still pending.
                let _ = ack_rx.await;
            }
            // The reader loop keeps completing waiters with real responses
            // during this window; only requests still unanswered once it
            // elapses (or the transport closes first) get force-failed.
            let _ = tokio::time::timeout(CLOSE_DRAIN_GRACE, generation.failed.notified()).await;
            generation.registry.fail_all(false);
        }
        self.shared.set_state(ConnState::Closed);
    }

    /// Abandon the connection immediately, failing every outstanding and
    /// future submission with a non-retryable `ConnectionClosed`.
    pub fn abort(&self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(generation) = self.shared.generation.swap(None) {
            generation.registry.fail_all(false);
            generation.failed.notify_waiters();
        }
        self.shared.set_state(ConnState::Closed);
    }
}

async fn send_key_only(shared: &Arc<Shared>, opcode: Opcode, key: &str) -> Result<(), Error> {
    let generation = shared
        .generation
        .load_full()
        .ok_or(Error::ConnectionClosed { retryable: true })?;
    let sync = generation
        .registry
        .alloc_sync()
        .map_err(|_| Error::ConnectionClosed { retryable: true })?;
    let header = Header::request(opcode, sync, None);
    let body = rmpv::Value::Map(vec![(
        rmpv::Value::from(crate::frame::body_key::EVENT_KEY as u64),
        rmpv::Value::from(key),
    )]);
    let payload = codec::encode_frame(&header, &body).map_err(Error::Protocol)?;
    generation
        .writer_tx
        .send(WriterCommand::Frame(payload))
        .await
        .map_err(|_| Error::ConnectionClosed { retryable: true })
}

/// Submit `request`, optionally bound to `stream_id`. Shared by
/// `Connection::submit` and `StreamHandle::submit`.
pub(crate) async fn submit<R: Request>(
    shared: &Arc<Shared>,
    request: R,
    stream_id: Option<u64>,
) -> Result<R::Response, Error> {
    let stream_id = stream_id.or_else(|| request.stream_id());
    let idempotent = request.is_idempotent() || shared.config.idempotent_by_default;

    let mut attempted_refresh = false;
    loop {
        let generation = shared
            .generation
            .load_full()
            .ok_or(Error::ConnectionClosed { retryable: true })?;

        let sync = generation
            .registry
            .alloc_sync()
            .map_err(|_| Error::ConnectionClosed { retryable: true })?;

        let mut body_buf = bytes::BytesMut::new();
        let resolver = Resolver { cache: &shared.schema };
        match request.encode_body(&resolver, &mut body_buf) {
            Ok(()) => {}
            Err(crate::error::ProtocolError::Schema(
                e @ (SchemaError::UnknownSpace(_) | SchemaError::UnknownIndex(_)),
            )) if !attempted_refresh => {
                attempted_refresh = true;
                let _ = e;
                refresh_schema(shared).await?;
                continue;
            }
            Err(e) => return Err(Error::Protocol(e)),
        }

        let header = Header::request(request.opcode(), sync, stream_id);
        let payload = match codec::encode_frame_raw_body(&header, &body_buf) {
            Ok(p) => p,
            Err(e) => return Err(Error::Protocol(e)),
        };

        if request.is_async() {
            generation
                .writer_tx
                .send(WriterCommand::Frame(payload))
                .await
                .map_err(|_| Error::ConnectionClosed { retryable: true })?;
            // SAFETY valve: an async request's Response type must be able
            // to represent "no reply was ever sought"; collaborators that
            // define async requests pick `()` or similar as `Response`.
            return request
                .decode_response(&[])
                .map_err(Error::Protocol);
        }

        let rx = generation.registry.register(sync, idempotent);

        if let Err(_closed) = generation.writer_tx.send(WriterCommand::Frame(payload)).await {
            generation.registry.cancel(sync);
            return Err(Error::ConnectionClosed { retryable: true });
        }

        let deadline = request.deadline().or(shared.config.default_deadline);
        let outcome = await_response(rx, deadline, request.cancellation()).await;
        let result = match outcome {
            ResponseOutcome::Delivered(result) => result,
            ResponseOutcome::TimedOut => {
                generation.registry.cancel(sync);
                Err(Error::Timeout)
            }
            ResponseOutcome::Cancelled => {
                generation.registry.cancel(sync);
                Err(Error::Cancelled)
            }
        };

        match result {
            Ok(body) => return request.decode_response(&body).map_err(Error::Protocol),
            Err(Error::Server { code, .. }) if code == WRONG_SCHEMA_VERSION && !attempted_refresh => {
                attempted_refresh = true;
                refresh_schema(shared).await?;
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

enum ResponseOutcome {
    Delivered(Result<bytes::Bytes, Error>),
    TimedOut,
    Cancelled,
}

/// Race a registered waiter against an optional per-request deadline and an
/// optional cancellation token. Whichever of the three resolves first wins;
/// the caller is responsible for evicting the waiter on anything but
/// `Delivered`.
async fn await_response(
    rx: tokio::sync::oneshot::Receiver<Result<bytes::Bytes, Error>>,
    deadline: Option<std::time::Duration>,
    cancellation: Option<&crate::request::CancelToken>,
) -> ResponseOutcome {
    let recv = async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed { retryable: true }),
        }
    };

    match (deadline, cancellation) {
        (Some(d), Some(token)) => tokio::select! {
            result = tokio::time::timeout(d, recv) => match result {
                Ok(result) => ResponseOutcome::Delivered(result),
                Err(_) => ResponseOutcome::TimedOut,
            },
            _ = token.cancelled() => ResponseOutcome::Cancelled,
        },
        (Some(d), None) => match tokio::time::timeout(d, recv).await {
            Ok(result) => ResponseOutcome::Delivered(result),
            Err(_) => ResponseOutcome::TimedOut,
        },
        (None, Some(token)) => tokio::select! {
            result = recv => ResponseOutcome::Delivered(result),
            _ = token.cancelled() => ResponseOutcome::Cancelled,
        },
        (None, None) => ResponseOutcome::Delivered(recv.await),
    }
}

/// `ER_WRONG_SCHEMA_VERSION`: the server rejected a request because the
/// schema version it carried is stale. Triggers exactly one local refresh
/// and retry before the error is surfaced to the caller.
const WRONG_SCHEMA_VERSION: u32 = 109;

/// Fetch `_vspace`/`_vindex` and atomically publish a new snapshot.
/// Concurrent callers converge on [`SchemaCache::begin_refresh`], so at most
/// one of them actually issues the two SELECTs.
#[instrument(skip(shared))]
pub(crate) async fn refresh_schema(shared: &Arc<Shared>) -> Result<(), Error> {
    let Some(_permit) = shared.schema.begin_refresh().await else {
        return Ok(());
    };

    let vspace_rows = select_system_space(shared, VSPACE_ID).await?;
    let vindex_rows = select_system_space(shared, VINDEX_ID).await?;

    let snapshot = crate::schema_decode::build_snapshot(vspace_rows, vindex_rows)
        .map_err(Error::Protocol)?;
    shared.schema.install(snapshot);
    Ok(())
}

const VSPACE_ID: u32 = 281;
const VINDEX_ID: u32 = 289;

async fn select_system_space(shared: &Arc<Shared>, space_id: u32) -> Result<Vec<rmpv::Value>, Error> {
    let generation = shared
        .generation
        .load_full()
        .ok_or(Error::ConnectionClosed { retryable: true })?;
    let sync = generation
        .registry
        .alloc_sync()
        .map_err(|_| Error::ConnectionClosed { retryable: true })?;

    let body = rmpv::Value::Map(vec![
        (
            rmpv::Value::from(crate::frame::body_key::SPACE_ID as u64),
            rmpv::Value::from(space_id),
        ),
        (
            rmpv::Value::from(crate::frame::body_key::INDEX_ID as u64),
            rmpv::Value::from(0u32),
        ),
        (
            rmpv::Value::from(crate::frame::body_key::ITERATOR as u64),
            rmpv::Value::from(crate::frame::Iterator::All as u8),
        ),
        (
            rmpv::Value::from(crate::frame::body_key::LIMIT as u64),
            rmpv::Value::from(u32::MAX),
        ),
        (
            rmpv::Value::from(crate::frame::body_key::OFFSET as u64),
            rmpv::Value::from(0u32),
        ),
        (
            rmpv::Value::from(crate::frame::body_key::KEY as u64),
            rmpv::Value::Array(vec![]),
        ),
    ]);

    let header = Header::request(Opcode::Select, sync, None);
    let payload = codec::encode_frame(&header, &body).map_err(Error::Protocol)?;

    let rx = generation.registry.register(sync, true);
    generation
        .writer_tx
        .send(WriterCommand::Frame(payload))
        .await
        .map_err(|_| Error::ConnectionClosed { retryable: true })?;

    let body = rx.await.map_err(|_| Error::ConnectionClosed { retryable: true })??;
    let value = codec::decode_value(&body).map_err(Error::Protocol)?;
    let rows = value
        .as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_u64() == Some(crate::frame::body_key::DATA as u64)))
        .and_then(|(_, v)| v.as_array())
        .cloned()
        .unwrap_or_default();
    Ok(rows)
}

/// Dial, run the handshake, and spin up the writer/reader tasks for a fresh
/// generation.
async fn dial_and_spawn(shared: &Arc<Shared>) -> Result<GenerationState, Error> {
    let DialedTransport {
        read,
        write,
        server_version_banner,
        server_features: _,
        peer_supports_names,
    } = dialer::dial(&shared.config).await?;

    shared.schema.set_peer_supports_names(peer_supports_names);
    info!(banner = %server_version_banner, "handshake complete");

    let id = shared.gen_counter.fetch_add(1, Ordering::AcqRel) + 1;
    let registry = Arc::new(RequestRegistry::new());
    let failed = Arc::new(Notify::new());
    let (writer_tx, writer_rx) = mpsc::channel(shared.config.writer_queue_capacity);

    tokio::spawn(writer::run(writer_rx, write, failed.clone()));
    tokio::spawn(reader::run(
        read,
        registry.clone(),
        shared.schema.clone(),
        shared.watchers.clone(),
        failed.clone(),
    ));

    Ok(GenerationState {
        id,
        registry,
        writer_tx,
        stream_ids: StreamIdAllocator::new(),
        failed,
    })
}

/// Background task: watches the live generation for failure and runs the
/// reconnect state machine described in the supervisor's transition table.
async fn supervise(shared: Arc<Shared>) {
    loop {
        let Some(generation) = shared.generation.load_full() else {
            return;
        };
        generation.failed.notified().await;

        if shared.closing.load(Ordering::Acquire) {
            return;
        }

        shared.generation.store(None);
        // Any `submit()` still holding this generation's `Arc` keeps its
        // registry alive, so the waiter map must be failed explicitly —
        // dropping the shared slot above only stops *new* submissions from
        // reaching it.
        generation.registry.fail_all(true);
        shared.set_state(ConnState::Reconnecting);
        warn!("connection lost, entering reconnecting state");

        let mut attempt = 0u32;
        loop {
            if shared.closing.load(Ordering::Acquire) {
                return;
            }

            match dial_and_spawn(&shared).await {
                Ok(generation) => {
                    resubscribe_watchers(&shared, &generation).await;
                    shared.generation.store(Some(Arc::new(generation)));
                    shared.set_state(ConnState::Ready);
                    debug!(attempt, "reconnected");
                    break;
                }
                Err(Error::Unsupported(_)) => {
                    // A required-feature mismatch on reconnect is fatal.
                    shared.set_state(ConnState::Closed);
                    return;
                }
                Err(error) => {
                    if let Some(max) = shared.config.max_reconnect_attempts {
                        if attempt >= max {
                            warn!(%error, "reconnect attempts exhausted, closing");
                            shared.set_state(ConnState::Closed);
                            return;
                        }
                    }
                    let delay = shared.config.backoff.delay_for(attempt);
                    warn!(%error, attempt, ?delay, "reconnect attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

async fn resubscribe_watchers(shared: &Arc<Shared>, generation: &GenerationState) {
    for key in shared.watchers.subscribed_keys() {
        let Ok(sync) = generation.registry.alloc_sync() else {
            continue;
        };
        let header = Header::request(Opcode::Watch, sync, None);
        let body = rmpv::Value::Map(vec![(
            rmpv::Value::from(crate::frame::body_key::EVENT_KEY as u64),
            rmpv::Value::from(key.as_str()),
        )]);
        if let Ok(payload) = codec::encode_frame(&header, &body) {
            let _ = generation.writer_tx.send(WriterCommand::Frame(payload)).await;
        }
    }
}

