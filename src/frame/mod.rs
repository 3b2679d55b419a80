//! IPROTO frame header constants and the `Header` value that rides in every
//! frame's header map.

pub(crate) mod greeting;
pub(crate) mod header;

pub use greeting::Greeting;
pub use header::Header;

/// IPROTO request/response type codes.
///
/// Response frames reuse the request opcode space: bit 15 (`TYPE_ERROR_FLAG`)
/// is set on the wire to mark a response as carrying a `ServerError` instead
/// of `data`; callers only ever see the unflagged [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Opcode {
    Ok,
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call16,
    Auth,
    Eval,
    Upsert,
    Call,
    Execute,
    Nop,
    Prepare,
    Begin,
    Commit,
    Rollback,
    Ping,
    Id,
    Watch,
    Unwatch,
    Event,
    WatchOnce,
    Chunk,
    /// Any opcode this client doesn't recognize; carries the raw wire value.
    Unknown(u32),
}

pub const TYPE_ERROR_FLAG: u32 = 1 << 15;

impl Opcode {
    pub fn code(self) -> u32 {
        match self {
            Opcode::Ok => 0,
            Opcode::Select => 1,
            Opcode::Insert => 2,
            Opcode::Replace => 3,
            Opcode::Update => 4,
            Opcode::Delete => 5,
            Opcode::Call16 => 6,
            Opcode::Auth => 7,
            Opcode::Eval => 8,
            Opcode::Upsert => 9,
            Opcode::Call => 10,
            Opcode::Execute => 11,
            Opcode::Nop => 12,
            Opcode::Prepare => 13,
            Opcode::Begin => 14,
            Opcode::Commit => 15,
            Opcode::Rollback => 16,
            Opcode::Ping => 64,
            Opcode::Id => 73,
            Opcode::Watch => 74,
            Opcode::Unwatch => 75,
            Opcode::Event => 76,
            Opcode::WatchOnce => 77,
            Opcode::Chunk => 128,
            Opcode::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Opcode {
        match code {
            0 => Opcode::Ok,
            1 => Opcode::Select,
            2 => Opcode::Insert,
            3 => Opcode::Replace,
            4 => Opcode::Update,
            5 => Opcode::Delete,
            6 => Opcode::Call16,
            7 => Opcode::Auth,
            8 => Opcode::Eval,
            9 => Opcode::Upsert,
            10 => Opcode::Call,
            11 => Opcode::Execute,
            12 => Opcode::Nop,
            13 => Opcode::Prepare,
            14 => Opcode::Begin,
            15 => Opcode::Commit,
            16 => Opcode::Rollback,
            64 => Opcode::Ping,
            73 => Opcode::Id,
            74 => Opcode::Watch,
            75 => Opcode::Unwatch,
            76 => Opcode::Event,
            77 => Opcode::WatchOnce,
            128 => Opcode::Chunk,
            other => Opcode::Unknown(other),
        }
    }

    /// True for requests the server never replies to.
    pub fn is_always_async(self) -> bool {
        false
    }
}

/// Integer keys used in the header map.
pub mod header_key {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
    pub const STREAM_ID: u8 = 0x0a;
}

/// Integer keys used in request/response body maps.
pub mod body_key {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const INDEX_BASE: u8 = 0x15;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const SPACE_NAME: u8 = 0x33;
    pub const INDEX_NAME: u8 = 0x34;
    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const STMT_ID: u8 = 0x43;
    pub const TIMEOUT: u8 = 0x56;
    pub const ISOLATION: u8 = 0x5f;
    pub const AFTER: u8 = 0x61;
    pub const FETCH_POSITION: u8 = 0x63;
    pub const ERROR: u8 = 0x52;
    pub const VERSION: u8 = 0x54;
    pub const FEATURES: u8 = 0x55;
    pub const EVENT_KEY: u8 = 0x57;
    pub const EVENT_DATA: u8 = 0x58;
    pub const AUTH_TYPE: u8 = 0x5b;
}

/// `SELECT`/`DELETE` iterator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Iterator {
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsetAll = 7,
    BitsetAny = 8,
    BitsetAllNot = 9,
    Overlaps = 10,
    Neighbor = 11,
}

/// `BEGIN` isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Isolation {
    Default = 0,
    ReadCommitted = 1,
    ReadConfirmed = 2,
    BestEffort = 3,
    Linearizable = 4,
}
