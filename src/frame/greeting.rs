use crate::error::ProtocolError;

pub const GREETING_LEN: usize = 128;
const BANNER_LEN: usize = 64;
const SALT_B64_LEN: usize = 44;
const SALT_RAW_LEN: usize = 32;
pub const AUTH_SALT_LEN: usize = 20;

/// The 128-byte banner every server sends immediately after accepting the
/// transport, before any frame is exchanged.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub version_banner: String,
    salt: [u8; SALT_RAW_LEN],
}

impl Greeting {
    /// Parse a greeting from the first 128 bytes read off the wire.
    pub fn parse(buf: &[u8; GREETING_LEN]) -> Result<Greeting, ProtocolError> {
        let banner = std::str::from_utf8(&buf[..BANNER_LEN])
            .map_err(|_| ProtocolError::BadGreeting)?
            .trim_end()
            .to_string();

        if !banner.contains("Tarantool") {
            return Err(ProtocolError::BadGreeting);
        }

        let salt_b64 = std::str::from_utf8(&buf[BANNER_LEN..BANNER_LEN + SALT_B64_LEN])
            .map_err(|_| ProtocolError::BadGreeting)?
            .trim_end();

        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, salt_b64)
            .map_err(|_| ProtocolError::BadGreeting)?;

        if decoded.len() < SALT_RAW_LEN {
            return Err(ProtocolError::BadGreeting);
        }

        let mut salt = [0u8; SALT_RAW_LEN];
        salt.copy_from_slice(&decoded[..SALT_RAW_LEN]);

        Ok(Greeting {
            version_banner: banner,
            salt,
        })
    }

    /// The 20 bytes of salt actually fed into the `chap-sha1` scramble.
    pub fn auth_salt(&self) -> &[u8] {
        &self.salt[..AUTH_SALT_LEN]
    }
}
