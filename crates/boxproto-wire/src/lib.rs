//! boxproto-wire — IPROTO wire codec.
//!
//! Encodes requests into length-prefixed MessagePack frames and decodes
//! server responses back into typed headers plus keyed body fields.
//!
//! # Frame layout
//!
//! ```text
//! [0xce][4-byte big-endian length]   5-byte size reservation
//! [MessagePack map]                  header: request type, sync, stream id
//! [MessagePack map]                  body: request-kind specific keys
//! ```
//!
//! The length excludes the 5 reservation bytes and is patched in after the
//! body has been serialized, so a stream reader can frame packets without
//! any other delimiter.
//!
//! Application payloads (keys, tuples, call arguments, SQL binds) cross this
//! API as pre-encoded MessagePack byte ranges; decoded response fields
//! surface as [`rmpv::Value`]. Value-level codecs live with the caller.

pub mod codec;
pub mod consts;
pub mod error;
pub mod request;
pub mod response;

pub use codec::{encode_request, read_frame};
pub use error::{WireError, WireResult};
pub use request::{IndexRef, IteratorType, Request, SpaceRef, Statement};
pub use response::Response;
