//! boxproto-pool — a self-healing pool of IPROTO connections.
//!
//! Connections are organized into tagged groups and addressed as
//! `(tag, index)`. Each slot runs its own lifecycle task: connect, probe
//! the server on a fixed interval, and reconnect after a fixed delay when
//! the connection is lost or the heartbeat kills it.
//!
//! # Architecture
//!
//! ```text
//! Pool
//!   ├── groups: tag → InstanceGroup description
//!   ├── entries: tag → Vec<PoolEntry>
//!   │     └── lifecycle task per slot
//!   │           connect → serve heartbeats → close → wait → reconnect
//!   └── gauges: total / unavailable / reconnecting
//! ```
//!
//! Health is judged by a sliding window of probe outcomes
//! ([`Heartbeat`]): too many recent failures lock the slot away
//! (callers see [`PoolGet::Unavailable`]), recovery unlocks it, and
//! persistent failure while locked drops the connection entirely.

pub mod entry;
pub mod error;
pub mod heartbeat;
pub mod pool;

pub use entry::PoolGet;
pub use error::{PoolError, PoolResult};
pub use heartbeat::{
    ping_probe, HealthProbe, Heartbeat, HeartbeatParams, HeartbeatState, ProbeFuture, Transition,
};
pub use pool::{InstanceGroup, Pool};
