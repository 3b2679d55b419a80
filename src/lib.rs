//! Core connection engine for a MessagePack-based binary database wire
//! protocol: a full-duplex, pipelined, authenticated TCP client that
//! multiplexes requests by sync id, caches the remote schema, manages
//! transactional streams, dispatches watcher push events, and reconnects
//! automatically on transport failure.
//!
//! This crate implements the engine only. Building request bodies for
//! specific operations (`SELECT`, `INSERT`, `CALL`, SQL, …) is left to
//! collaborating crates that implement [`Request`]; this crate drives
//! whatever they hand it across the wire.

mod connection;
mod dialer;
mod reader;
mod registry;
mod schema_decode;
mod transport;
mod writer;

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod framer;
pub mod request;
pub mod schema;
pub mod stream;
pub mod watcher;

pub use config::{Backoff, Config, Credentials, Endpoint};
pub use connection::{ConnState, Connection};
pub use error::{Error, Result};
pub use frame::Opcode;
pub use request::{CancelToken, IndexRef, Request, SchemaResolver, SpaceRef};
pub use schema::{FieldDef, IndexRecord, KeyPart, SchemaSnapshot, SpaceRecord};
pub use stream::StreamHandle;
pub use watcher::{WatcherHandler, WatcherToken};
