//! Request model — one variant per IPROTO request kind.
//!
//! Requests are a tagged union; the codec dispatches on the variant with one
//! body encoder per kind. Fields whose contents are application data (keys,
//! tuples, call arguments, SQL binds) are pre-encoded MessagePack byte
//! ranges supplied by the caller.

use crate::consts::request_type;

/// A space addressed either by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

/// An index addressed either by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

/// Select iterator codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IteratorType {
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

/// One IPROTO request.
///
/// `Watch` and `Unwatch` are fire-and-forget: they are framed without a
/// correlation id and the server never answers them directly.
#[derive(Debug, Clone)]
pub enum Request {
    Auth {
        user: String,
        /// Auth algorithm name, e.g. `"chap-sha1"`.
        method: String,
        /// Scramble bytes (CHAP) or cleartext password bytes (PAP).
        token: Vec<u8>,
    },
    Ping,
    Call {
        function: String,
        /// MessagePack array of arguments.
        args: Vec<u8>,
    },
    Eval {
        expr: String,
        /// MessagePack array of arguments.
        args: Vec<u8>,
    },
    Select {
        space: SpaceRef,
        index: IndexRef,
        limit: u32,
        offset: u32,
        iterator: IteratorType,
        /// MessagePack array forming the key.
        key: Vec<u8>,
        /// Ask the server to return a continuation position.
        fetch_position: bool,
        /// Opaque continuation position from a previous response.
        after_position: Option<Vec<u8>>,
        /// MessagePack tuple to continue after.
        after_tuple: Option<Vec<u8>>,
    },
    Insert {
        space: SpaceRef,
        tuple: Vec<u8>,
    },
    Replace {
        space: SpaceRef,
        tuple: Vec<u8>,
    },
    Update {
        space: SpaceRef,
        index: IndexRef,
        key: Vec<u8>,
        /// MessagePack array of update operations.
        ops: Vec<u8>,
    },
    Upsert {
        space: SpaceRef,
        tuple: Vec<u8>,
        ops: Vec<u8>,
    },
    Delete {
        space: SpaceRef,
        index: IndexRef,
        key: Vec<u8>,
    },
    Begin {
        /// Transaction timeout in seconds.
        timeout: Option<f64>,
        isolation: Option<u32>,
    },
    Commit,
    Rollback,
    Execute {
        statement: Statement,
        /// MessagePack array of bind parameters.
        bind: Option<Vec<u8>>,
    },
    Prepare {
        sql: String,
    },
    Id {
        version: u64,
        features: Vec<u64>,
    },
    Watch {
        key: String,
    },
    Unwatch {
        key: String,
    },
    WatchOnce {
        key: String,
    },
}

/// SQL statement reference for `Execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Sql(String),
    Prepared(u64),
}

impl Request {
    /// Wire request-type code for this variant.
    pub fn request_type(&self) -> u32 {
        match self {
            Request::Auth { .. } => request_type::AUTH,
            Request::Ping => request_type::PING,
            Request::Call { .. } => request_type::CALL,
            Request::Eval { .. } => request_type::EVAL,
            Request::Select { .. } => request_type::SELECT,
            Request::Insert { .. } => request_type::INSERT,
            Request::Replace { .. } => request_type::REPLACE,
            Request::Update { .. } => request_type::UPDATE,
            Request::Upsert { .. } => request_type::UPSERT,
            Request::Delete { .. } => request_type::DELETE,
            Request::Begin { .. } => request_type::BEGIN,
            Request::Commit => request_type::COMMIT,
            Request::Rollback => request_type::ROLLBACK,
            Request::Execute { .. } => request_type::EXECUTE,
            Request::Prepare { .. } => request_type::PREPARE,
            Request::Id { .. } => request_type::ID,
            Request::Watch { .. } => request_type::WATCH,
            Request::Unwatch { .. } => request_type::UNWATCH,
            Request::WatchOnce { .. } => request_type::WATCH_ONCE,
        }
    }

    /// Whether this request is framed without a correlation id and never
    /// receives a direct reply.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Request::Watch { .. } | Request::Unwatch { .. })
    }

    /// Convenience constructor for a select with default paging.
    pub fn select(space: SpaceRef, index: IndexRef, iterator: IteratorType, key: Vec<u8>) -> Self {
        Request::Select {
            space,
            index,
            limit: u32::MAX,
            offset: 0,
            iterator,
            key,
            fetch_position: false,
            after_position: None,
            after_tuple: None,
        }
    }
}
