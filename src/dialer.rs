//! Transport establishment and the handshake sub-protocol: greeting parse,
//! `IPROTO_ID` negotiation, `IPROTO_AUTH`.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rmpv::Value;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument};

use crate::codec;
use crate::config::Config;
use crate::error::{AuthError, Error, ProtocolError, TransportError, UnsupportedError};
use crate::frame::{body_key, Greeting, Header, Opcode};
use crate::framer::Framer;
use crate::transport::BoxedTransport;

/// IPROTO_ID / IPROTO_FEATURE_* — the subset of optional wire behaviors this
/// client negotiates for.
pub mod feature {
    pub const STREAMS: u32 = 0;
    pub const TRANSACTIONS: u32 = 1;
    pub const ERROR_EXTENSION: u32 = 2;
    pub const WATCHERS: u32 = 3;
}

const CLIENT_PROTOCOL_VERSION: u32 = 4;
const DEFAULT_AUTH_METHOD: &str = "chap-sha1";

pub struct DialedTransport {
    pub read: FramedRead<ReadHalf<BoxedTransport>, Framer>,
    pub write: FramedWrite<WriteHalf<BoxedTransport>, Framer>,
    pub server_version_banner: String,
    pub server_features: Vec<u32>,
    pub peer_supports_names: bool,
}

/// Open the transport and run the handshake to completion. On success the
/// returned halves are ready for the writer/reader loops to take over; no
/// application frame has been left unconsumed.
#[instrument(skip(config), fields(endpoint = %config.endpoint))]
pub async fn dial(config: &Config) -> Result<DialedTransport, Error> {
    let tcp = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((config.endpoint.host.as_str(), config.endpoint.port)),
    )
    .await
    .map_err(|_| {
        Error::Transport(TransportError::Connect {
            endpoint: config.endpoint.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })
    })?
    .map_err(|source| {
        Error::Transport(TransportError::Connect {
            endpoint: config.endpoint.to_string(),
            source,
        })
    })?;
    tcp.set_nodelay(true).ok();

    let boxed = dial_boxed_transport(tcp, config).await?;
    dial_transport(boxed, config).await
}

#[cfg(feature = "tls")]
async fn dial_boxed_transport(tcp: TcpStream, config: &Config) -> Result<BoxedTransport, Error> {
    match &config.tls {
        Some(tls_config) => dial_tls(tcp, config, tls_config.clone()).await,
        None => Ok(Box::new(tcp)),
    }
}

#[cfg(not(feature = "tls"))]
async fn dial_boxed_transport(tcp: TcpStream, _config: &Config) -> Result<BoxedTransport, Error> {
    Ok(Box::new(tcp))
}

/// Wrap `tcp` in a TLS session negotiated from `tls_config` before the
/// greeting is read off the wire.
#[cfg(feature = "tls")]
async fn dial_tls(
    tcp: TcpStream,
    config: &Config,
    tls_config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
) -> Result<BoxedTransport, Error> {
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    let server_name = ServerName::try_from(config.endpoint.host.clone())
        .map_err(|_| {
            Error::Transport(TransportError::Connect {
                endpoint: config.endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid TLS server name"),
            })
        })?;

    let connector = TlsConnector::from(tls_config);
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(TransportError::Io)?;
    Ok(Box::new(stream))
}

async fn dial_transport(mut transport: BoxedTransport, config: &Config) -> Result<DialedTransport, Error> {
    let mut greeting_buf = [0u8; crate::frame::greeting::GREETING_LEN];
    transport
        .read_exact(&mut greeting_buf)
        .await
        .map_err(TransportError::Io)?;
    let greeting = Greeting::parse(&greeting_buf).map_err(Error::Protocol)?;
    debug!(banner = %greeting.version_banner, "received greeting");

    let (read_half, write_half) = tokio::io::split(transport);
    let mut read = FramedRead::new(read_half, Framer::new());
    let mut write = FramedWrite::new(write_half, Framer::new());

    let mut sync = 0u32;
    let mut next_sync = || {
        sync += 1;
        sync
    };

    if let Some(creds) = &config.credentials {
        authenticate(&mut read, &mut write, &greeting, creds, next_sync()).await?;
    }

    let (server_features, peer_supports_names) =
        negotiate_id(&mut read, &mut write, next_sync()).await?;

    for required in &config.required_features {
        if !server_features.contains(required) {
            return Err(Error::Unsupported(UnsupportedError::MissingFeature(*required)));
        }
    }

    Ok(DialedTransport {
        read,
        write,
        server_version_banner: greeting.version_banner,
        server_features,
        peer_supports_names,
    })
}

async fn authenticate(
    read: &mut FramedRead<ReadHalf<BoxedTransport>, Framer>,
    write: &mut FramedWrite<WriteHalf<BoxedTransport>, Framer>,
    greeting: &Greeting,
    creds: &crate::config::Credentials,
    sync: u32,
) -> Result<(), Error> {
    let scramble = chap_sha1_scramble(greeting.auth_salt(), creds.password.as_bytes());

    let body = Value::Map(vec![
        (
            Value::from(body_key::USER_NAME as u64),
            Value::from(creds.user.as_str()),
        ),
        (
            Value::from(body_key::TUPLE as u64),
            Value::Array(vec![
                Value::from(DEFAULT_AUTH_METHOD),
                Value::Binary(scramble.to_vec()),
            ]),
        ),
    ]);

    let header = Header::request(Opcode::Auth, sync, None);
    send_handshake_frame(write, &header, &body).await?;
    let (resp_header, resp_body) = recv_handshake_frame(read).await?;

    if resp_header.sync != sync {
        return Err(Error::Protocol(ProtocolError::Malformed(
            "auth response sync mismatch".into(),
        )));
    }

    if resp_header.is_error {
        let value = codec::decode_value(&resp_body).map_err(Error::Protocol)?;
        let (message, _extra, _stack) = crate::frame::header::decode_server_error(&value);
        return Err(Error::Auth(AuthError::Rejected(message)));
    }

    Ok(())
}

/// The default `chap-sha1` scramble: `xor(sha1(password), sha1(salt ||
/// sha1(sha1(password))))`.
pub fn chap_sha1_scramble(salt: &[u8], password: &[u8]) -> [u8; 20] {
    let sha1_pw = Sha1::digest(password);
    let sha1_sha1_pw = Sha1::digest(sha1_pw);

    let mut salted = Vec::with_capacity(salt.len() + sha1_sha1_pw.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(&sha1_sha1_pw);
    let step3 = Sha1::digest(&salted);

    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = sha1_pw[i] ^ step3[i];
    }
    out
}

async fn negotiate_id(
    read: &mut FramedRead<ReadHalf<BoxedTransport>, Framer>,
    write: &mut FramedWrite<WriteHalf<BoxedTransport>, Framer>,
    sync: u32,
) -> Result<(Vec<u32>, bool), Error> {
    let features = vec![
        feature::STREAMS,
        feature::TRANSACTIONS,
        feature::ERROR_EXTENSION,
        feature::WATCHERS,
    ];

    let body = Value::Map(vec![
        (
            Value::from(body_key::VERSION as u64),
            Value::from(CLIENT_PROTOCOL_VERSION),
        ),
        (
            Value::from(body_key::FEATURES as u64),
            Value::Array(features.iter().map(|f| Value::from(*f)).collect()),
        ),
    ]);

    let header = Header::request(Opcode::Id, sync, None);
    send_handshake_frame(write, &header, &body).await?;
    let (resp_header, resp_body) = recv_handshake_frame(read).await?;

    if resp_header.is_error {
        let value = codec::decode_value(&resp_body).map_err(Error::Protocol)?;
        let (message, _extra, _stack) = crate::frame::header::decode_server_error(&value);
        return Err(Error::Protocol(ProtocolError::Malformed(message)));
    }

    let value = codec::decode_value(&resp_body).map_err(Error::Protocol)?;
    let map = value
        .as_map()
        .ok_or_else(|| Error::Protocol(ProtocolError::Malformed("ID response not a map".into())))?;

    let mut server_features = Vec::new();
    let mut server_version = 0u32;
    for (k, v) in map {
        match k.as_u64() {
            Some(n) if n == body_key::FEATURES as u64 => {
                if let Some(arr) = v.as_array() {
                    server_features = arr.iter().filter_map(|f| f.as_u64().map(|n| n as u32)).collect();
                }
            }
            Some(n) if n == body_key::VERSION as u64 => {
                server_version = v.as_u64().unwrap_or(0) as u32;
            }
            _ => {}
        }
    }

    // Name-based space/index references were introduced in protocol
    // version 3; both sides must speak at least that version.
    let negotiated_version = CLIENT_PROTOCOL_VERSION.min(server_version);
    let peer_supports_names = negotiated_version >= 3;

    Ok((server_features, peer_supports_names))
}

async fn send_handshake_frame(
    write: &mut FramedWrite<WriteHalf<BoxedTransport>, Framer>,
    header: &Header,
    body: &Value,
) -> Result<(), Error> {
    let payload = codec::encode_frame(header, body).map_err(Error::Protocol)?;
    write.send(payload).await.map_err(Error::Transport)
}

async fn recv_handshake_frame(
    read: &mut FramedRead<ReadHalf<BoxedTransport>, Framer>,
) -> Result<(Header, Bytes), Error> {
    let payload = read
        .next()
        .await
        .ok_or(Error::Transport(TransportError::Closed))?
        .map_err(Error::Transport)?;
    codec::split_frame(&payload).map_err(Error::Protocol)
}
