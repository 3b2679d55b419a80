//! An in-process stand-in for a server: binds a loopback TCP listener,
//! scripts greeting/auth/handshake bytes exactly as a real peer would send
//! them, and lets each scenario assert on or reply to whatever the client
//! writes next.

pub mod requests;

use futures_util::{SinkExt, StreamExt};
use iproto_client::codec;
use iproto_client::frame::{Header, Opcode};
use iproto_client::framer::Framer;
use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const DEFAULT_SALT: [u8; 20] = [7u8; 20];

pub struct FakeServer {
    listener: TcpListener,
    pub addr: std::net::SocketAddr,
}

impl FakeServer {
    pub async fn bind() -> FakeServer {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind loopback");
        let addr = listener.local_addr().expect("local_addr");
        FakeServer { listener, addr }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accept the next inbound connection and hand back a scripting handle.
    pub async fn accept(&self) -> FakeConn {
        let (socket, _) = self.listener.accept().await.expect("accept");
        socket.set_nodelay(true).ok();
        FakeConn {
            framed: Framed::new(socket, Framer::new()),
        }
    }
}

pub struct FakeConn {
    framed: Framed<TcpStream, Framer>,
}

impl FakeConn {
    pub async fn send_greeting(&mut self) {
        self.send_greeting_with_salt(&DEFAULT_SALT).await
    }

    pub async fn send_greeting_with_salt(&mut self, salt20: &[u8]) {
        let mut buf = [b' '; 128];

        let banner = b"Tarantool 2.11.0 (Binary) abcdef01-2345-6789-abcd-ef0123456789";
        buf[..banner.len().min(63)].copy_from_slice(&banner[..banner.len().min(63)]);
        buf[63] = b'\n';

        let mut salt32 = [0u8; 32];
        let n = salt20.len().min(32);
        salt32[..n].copy_from_slice(&salt20[..n]);
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, salt32);
        let encoded = encoded.into_bytes();
        assert_eq!(encoded.len(), 44, "32 raw bytes always base64-encode to 44 chars");
        buf[64..108].copy_from_slice(&encoded);
        buf[108] = b'\n';

        self.framed.get_mut().write_all(&buf).await.expect("write greeting");
    }

    /// Receive and decode the next frame as (header, body value).
    pub async fn recv_frame(&mut self) -> (Header, Value) {
        let payload = self
            .framed
            .next()
            .await
            .expect("connection closed before frame arrived")
            .expect("transport read error");
        let (header, body) = codec::split_frame(&payload).expect("malformed frame from client");
        let value = codec::decode_value(&body).expect("malformed body from client");
        (header, value)
    }

    /// Like [`recv_frame`](Self::recv_frame) but asserts the opcode.
    pub async fn expect(&mut self, opcode: Opcode) -> (Header, Value) {
        let (header, value) = self.recv_frame().await;
        assert_eq!(header.opcode.code(), opcode.code(), "unexpected opcode");
        (header, value)
    }

    pub async fn reply_ok(&mut self, sync: u32, body: Value) {
        let header = Header {
            opcode: Opcode::Ok,
            sync,
            schema_version: Some(1),
            stream_id: None,
            is_error: false,
        };
        let payload = codec::encode_frame(&header, &body).expect("encode reply");
        self.framed.send(payload).await.expect("send reply");
    }

    pub async fn reply_chunk(&mut self, sync: u32, body: Value) {
        let header = Header {
            opcode: Opcode::Chunk,
            sync,
            schema_version: Some(1),
            stream_id: None,
            is_error: false,
        };
        let payload = codec::encode_frame(&header, &body).expect("encode chunk");
        self.framed.send(payload).await.expect("send chunk");
    }

    pub async fn reply_error(&mut self, sync: u32, code: u32, message: &str) {
        let body = Value::Map(vec![(
            Value::from(iproto_client::frame::body_key::ERROR as u64),
            Value::Array(vec![Value::Map(vec![
                (Value::from("code"), Value::from(code)),
                (Value::from("message"), Value::from(message)),
            ])]),
        )]);
        let header = Header {
            opcode: Opcode::Ok,
            sync,
            schema_version: Some(1),
            stream_id: None,
            is_error: true,
        };
        let payload = codec::encode_frame(&header, &body).expect("encode error reply");
        self.framed.send(payload).await.expect("send error reply");
    }

    pub async fn push_event(&mut self, key: &str, data: Value) {
        let body = Value::Map(vec![
            (Value::from(iproto_client::frame::body_key::EVENT_KEY as u64), Value::from(key)),
            (Value::from(iproto_client::frame::body_key::EVENT_DATA as u64), data),
        ]);
        let header = Header {
            opcode: Opcode::Event,
            sync: 0,
            schema_version: None,
            stream_id: None,
            is_error: false,
        };
        let payload = codec::encode_frame(&header, &body).expect("encode event");
        self.framed.send(payload).await.expect("send event");
    }

    /// Abruptly drop the socket, simulating a transport failure.
    pub async fn disconnect(self) {
        drop(self.framed);
    }
}

pub fn data_body(rows: Vec<Value>) -> Value {
    Value::Map(vec![(Value::from(iproto_client::frame::body_key::DATA as u64), Value::Array(rows))])
}

pub fn field<'a>(body: &'a Value, key: u8) -> Option<&'a Value> {
    body.as_map()?.iter().find(|(k, _)| k.as_u64() == Some(key as u64)).map(|(_, v)| v)
}

pub fn id_response(version: u32, features: &[u32]) -> Value {
    Value::Map(vec![
        (Value::from(iproto_client::frame::body_key::VERSION as u64), Value::from(version)),
        (
            Value::from(iproto_client::frame::body_key::FEATURES as u64),
            Value::Array(features.iter().map(|f| Value::from(*f)).collect()),
        ),
    ])
}

pub fn vspace_row(id: u32, name: &str) -> Value {
    Value::Array(vec![
        Value::from(id),
        Value::from(1u32),
        Value::from(name),
        Value::from("memtx"),
        Value::from(0u32),
        Value::Map(vec![]),
        Value::Array(vec![]),
    ])
}

pub fn vindex_row(space_id: u32, index_id: u32, name: &str) -> Value {
    Value::Array(vec![
        Value::from(space_id),
        Value::from(index_id),
        Value::from(name),
        Value::from("tree"),
        Value::Map(vec![(Value::from("unique"), Value::from(true))]),
        Value::Array(vec![Value::Map(vec![
            (Value::from("field"), Value::from(0u32)),
            (Value::from("type"), Value::from("unsigned")),
        ])]),
    ])
}
