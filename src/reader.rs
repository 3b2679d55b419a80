//! The reader loop: the sole owner of the response side of the transport.
//! Reads one frame at a time, decodes its header, and dispatches by sync
//! and opcode.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use rmpv::Value;
use tokio::io::ReadHalf;
use tokio::sync::Notify;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec;
use crate::error::Error;
use crate::frame::{body_key, Header, Opcode};
use crate::framer::Framer;
use crate::registry::RequestRegistry;
use crate::schema::SchemaCache;
use crate::transport::BoxedTransport;
use crate::watcher::WatcherRegistry;

pub async fn run(
    mut stream: FramedRead<ReadHalf<BoxedTransport>, Framer>,
    registry: Arc<RequestRegistry>,
    schema: Arc<SchemaCache>,
    watchers: Arc<WatcherRegistry>,
    failed: Arc<Notify>,
) {
    loop {
        let payload = match stream.next().await {
            Some(Ok(payload)) => payload,
            Some(Err(error)) => {
                warn!(%error, "reader loop: transport read failed");
                failed.notify_waiters();
                return;
            }
            None => {
                debug!("reader loop: transport closed");
                failed.notify_waiters();
                return;
            }
        };

        let (header, body) = match codec::split_frame(&payload) {
            Ok(parts) => parts,
            Err(error) => {
                warn!(%error, "reader loop: malformed frame, dropping");
                continue;
            }
        };

        if let Some(version) = header.schema_version {
            schema.mark_stale_if_newer(version);
        }

        dispatch(header, body, &registry, &watchers);
    }
}

fn dispatch(header: Header, body: Bytes, registry: &RequestRegistry, watchers: &WatcherRegistry) {
    match header.opcode {
        Opcode::Event => {
            if let Err(error) = dispatch_event(&body, watchers) {
                warn!(%error, "reader loop: malformed event frame");
            }
        }
        Opcode::Chunk => {
            registry.append_chunk(header.sync, body);
        }
        _ => {
            let result = finalize_result(&header, header.sync, body, registry);
            if !registry.complete(header.sync, result) {
                warn!(sync = header.sync, opcode = ?header.opcode, "reader loop: unsolicited response");
            }
        }
    }
}

fn finalize_result(
    header: &Header,
    sync: u32,
    body: Bytes,
    registry: &RequestRegistry,
) -> Result<Bytes, Error> {
    let chunks = registry.take_chunks(sync);

    if header.is_error {
        let value = match codec::decode_value(&body) {
            Ok(v) => v,
            Err(e) => return Err(Error::Protocol(e)),
        };
        let (message, extra, stack) = crate::frame::header::decode_server_error(&value);
        let code = stack.first().map(|f| f.code).unwrap_or(0);
        return Err(Error::Server {
            code,
            message,
            extra,
            stack,
        });
    }

    if chunks.is_empty() {
        return Ok(body);
    }

    merge_chunks(chunks, body).map_err(Error::Protocol)
}

/// Reassemble a chunked result: every `IPROTO_CHUNK` carries a partial
/// `data` array which is logically appended to the terminating frame's
/// `data` array, with every other key in the terminating frame kept as-is.
fn merge_chunks(chunks: Vec<Bytes>, final_body: Bytes) -> Result<Bytes, crate::error::ProtocolError> {
    let mut merged_data = Vec::new();

    for chunk in &chunks {
        let value = codec::decode_value(chunk)?;
        if let Some(map) = value.as_map() {
            for (k, v) in map {
                if k.as_u64() == Some(body_key::DATA as u64) {
                    if let Some(arr) = v.as_array() {
                        merged_data.extend(arr.iter().cloned());
                    }
                }
            }
        }
    }

    let final_value = codec::decode_value(&final_body)?;
    let mut out = Vec::new();
    if let Some(map) = final_value.as_map() {
        for (k, v) in map {
            if k.as_u64() == Some(body_key::DATA as u64) {
                if let Some(arr) = v.as_array() {
                    merged_data.extend(arr.iter().cloned());
                }
                out.push((k.clone(), Value::Array(merged_data.clone())));
            } else {
                out.push((k.clone(), v.clone()));
            }
        }
    }

    let mut buf = bytes::BytesMut::new();
    codec::encode_value(&Value::Map(out), &mut buf)?;
    Ok(buf.freeze())
}

fn dispatch_event(body: &Bytes, watchers: &WatcherRegistry) -> Result<(), crate::error::ProtocolError> {
    let value = codec::decode_value(body)?;
    let map = value
        .as_map()
        .ok_or_else(|| crate::error::ProtocolError::Malformed("event body not a map".into()))?;

    let mut key = None;
    let mut data = Value::Nil;
    for (k, v) in map {
        match k.as_u64() {
            Some(n) if n == body_key::EVENT_KEY as u64 => key = v.as_str().map(|s| s.to_string()),
            Some(n) if n == body_key::EVENT_DATA as u64 => data = v.clone(),
            _ => {}
        }
    }

    let key = key.ok_or_else(|| crate::error::ProtocolError::Malformed("event missing key".into()))?;
    watchers.dispatch(&key, &data);
    Ok(())
}
