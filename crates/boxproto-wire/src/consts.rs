//! IPROTO protocol constants.
//!
//! Integer keys and request-type codes as defined by the wire protocol.
//! Header and body maps are MessagePack maps with these integer keys.

/// Request-type codes carried in the header under [`header_key::REQUEST_TYPE`].
pub mod request_type {
    pub const SELECT: u32 = 0x01;
    pub const INSERT: u32 = 0x02;
    pub const REPLACE: u32 = 0x03;
    pub const UPDATE: u32 = 0x04;
    pub const DELETE: u32 = 0x05;
    pub const AUTH: u32 = 0x07;
    pub const EVAL: u32 = 0x08;
    pub const UPSERT: u32 = 0x09;
    pub const CALL: u32 = 0x0a;
    pub const EXECUTE: u32 = 0x0b;
    pub const PREPARE: u32 = 0x0d;
    pub const BEGIN: u32 = 0x0e;
    pub const COMMIT: u32 = 0x0f;
    pub const ROLLBACK: u32 = 0x10;
    pub const PING: u32 = 0x40;
    pub const ID: u32 = 0x49;
    pub const WATCH: u32 = 0x4a;
    pub const UNWATCH: u32 = 0x4b;
    pub const WATCH_ONCE: u32 = 0x4d;
}

/// Header map keys.
pub mod header_key {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const STREAM_ID: u8 = 0x0a;
}

/// Body map keys (request side).
pub mod body_key {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const FETCH_POSITION: u8 = 0x1f;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const AFTER_POSITION: u8 = 0x2e;
    pub const AFTER_TUPLE: u8 = 0x2f;
    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const STMT_ID: u8 = 0x43;
    pub const VERSION: u8 = 0x54;
    pub const FEATURES: u8 = 0x55;
    pub const TIMEOUT: u8 = 0x56;
    pub const EVENT_KEY: u8 = 0x57;
    pub const TXN_ISOLATION: u8 = 0x59;
    pub const SPACE_NAME: u8 = 0x5e;
    pub const INDEX_NAME: u8 = 0x5f;
}

/// Body map keys (response side).
pub mod response_key {
    pub const DATA: u8 = 0x30;
    /// Legacy error message string.
    pub const ERROR_24: u8 = 0x31;
    pub const POSITION: u8 = 0x35;
    pub const ERROR: u8 = 0x52;
    pub const EVENT_KEY: u8 = 0x57;
    pub const EVENT_DATA: u8 = 0x58;
    pub const TUPLE_FORMATS: u8 = 0x60;
}

/// Bit set on a response code to flag an error; the low 15 bits carry the
/// server error code.
pub const ERROR_TYPE_FLAG: u32 = 0x8000;
