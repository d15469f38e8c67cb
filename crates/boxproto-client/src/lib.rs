//! boxproto-client — one authenticated, multiplexed IPROTO connection.
//!
//! A [`Connection`] owns exactly one TCP socket. Requests are framed with a
//! per-connection correlation id and resolved by a single reader task, so
//! many callers can issue requests concurrently over the same socket and
//! receive their answers out of send order.
//!
//! # Architecture
//!
//! ```text
//! Connection (cheap clones share one socket)
//!   ├── sync counter (monotonic, never reused)
//!   ├── pending table: sync → oneshot completion
//!   ├── writer half behind an async mutex (serialized writes)
//!   ├── watch registry: event key → callback
//!   └── reader task
//!         ├── resolves pending completions (ok / application error)
//!         ├── routes sync-less frames to watch callbacks
//!         └── on socket loss fails every pending completion
//! ```
//!
//! Connecting reads the server greeting, runs the auth exchange inline when
//! credentials are configured, and only then spawns the reader task.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod greeting;

pub use auth::{AuthMethod, SCRAMBLE_SIZE};
pub use config::ClientConfig;
pub use connection::{Connection, WatchEvent, WatchHandler};
pub use error::{ClientError, ClientResult};
pub use greeting::Greeting;
