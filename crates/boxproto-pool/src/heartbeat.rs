//! The heartbeat state machine.
//!
//! Pure and synchronous: the entry task feeds it one probe outcome per tick
//! and acts on the transition it returns. Outcomes live in a fixed-capacity
//! sliding window; crossing the failure threshold invalidates the
//! connection, recovering below it reactivates, and failures that keep
//! arriving while invalidated eventually kill it.

use std::collections::VecDeque;
use std::time::Duration;

use rmpv::Value;

use boxproto_client::{ClientResult, Connection};
use boxproto_wire::Response;

use crate::error::{PoolError, PoolResult};

/// Tuning knobs for one entry's heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatParams {
    /// Delay between probes.
    pub ping_interval: Duration,
    /// How many recent probe outcomes the window holds.
    pub window_size: usize,
    /// Failures within the window that invalidate the connection.
    pub invalidation_threshold: usize,
    /// Failing ticks tolerated while invalidated before the connection is
    /// killed outright.
    pub death_threshold: u32,
    /// Fixed delay before each reconnect attempt. No backoff: a database
    /// instance that is down tends to come back at an unpredictable moment,
    /// and a bounded probe rate is cheap.
    pub reconnect_after: Duration,
}

impl Default for HeartbeatParams {
    fn default() -> Self {
        HeartbeatParams {
            ping_interval: Duration::from_millis(3000),
            window_size: 4,
            invalidation_threshold: 2,
            death_threshold: 4,
            reconnect_after: Duration::from_millis(5000),
        }
    }
}

impl HeartbeatParams {
    pub fn validate(&self) -> PoolResult<()> {
        if self.window_size == 0 {
            return Err(PoolError::Config("window_size must be positive".into()));
        }
        if self.invalidation_threshold == 0 || self.invalidation_threshold > self.window_size {
            return Err(PoolError::Config(format!(
                "invalidation_threshold must be in 1..={}",
                self.window_size
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(PoolError::Config("ping_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Where the connection stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Healthy, handed out by the pool.
    Active,
    /// Too many recent failures; locked away until it recovers or dies.
    Invalidated,
    /// Beyond saving. The entry drops the connection and reconnects.
    Killed,
}

/// Decision returned by [`Heartbeat::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Unlock the entry: the window recovered below the threshold.
    Activate,
    /// Lock the entry: the window crossed the threshold, or is still at or
    /// above it on a later tick.
    Invalidate,
    /// Drop the connection and reconnect.
    Kill,
}

/// Sliding-window failure tracker for one connection.
#[derive(Debug)]
pub struct Heartbeat {
    window: VecDeque<bool>,
    capacity: usize,
    failures: usize,
    invalidation_threshold: usize,
    death_threshold: u32,
    /// Failing ticks seen while invalidated. Reset on reactivation.
    death_pings: u32,
    state: HeartbeatState,
}

impl Heartbeat {
    pub fn new(params: &HeartbeatParams) -> Heartbeat {
        Heartbeat {
            window: VecDeque::with_capacity(params.window_size),
            capacity: params.window_size,
            failures: 0,
            invalidation_threshold: params.invalidation_threshold,
            death_threshold: params.death_threshold,
            death_pings: 0,
            state: HeartbeatState::Active,
        }
    }

    /// A tracker pre-seeded with one successful outcome, so that a freshly
    /// established connection starts from known-good evidence rather than an
    /// empty window.
    pub fn seeded(params: &HeartbeatParams) -> Heartbeat {
        let mut hb = Heartbeat::new(params);
        hb.push(false);
        hb
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Failures currently inside the window.
    pub fn failure_count(&self) -> usize {
        self.failures
    }

    /// Records one probe outcome and returns the resulting transition, if
    /// any. No decision is made until the window has filled once; after a
    /// kill the tracker is inert and always returns `None`.
    pub fn record(&mut self, failed: bool) -> Option<Transition> {
        if self.state == HeartbeatState::Killed {
            return None;
        }
        self.push(failed);
        if self.window.len() < self.capacity {
            return None;
        }

        let unhealthy = self.failures >= self.invalidation_threshold;
        match self.state {
            HeartbeatState::Active if unhealthy => {
                self.state = HeartbeatState::Invalidated;
                // The tick that crosses the threshold is itself a failing
                // tick; it opens the death count.
                self.death_pings = 1;
                Some(Transition::Invalidate)
            }
            HeartbeatState::Active => None,
            HeartbeatState::Invalidated if !unhealthy => {
                self.state = HeartbeatState::Active;
                self.death_pings = 0;
                Some(Transition::Activate)
            }
            HeartbeatState::Invalidated => {
                if !failed {
                    // Still over the threshold, but not getting worse.
                    return Some(Transition::Invalidate);
                }
                // Compare before counting: the threshold reads failures
                // accumulated on previous invalidated ticks, so the kill
                // lands on the tick after the threshold is reached.
                let transition = if self.death_pings > self.death_threshold {
                    self.state = HeartbeatState::Killed;
                    Transition::Kill
                } else {
                    Transition::Invalidate
                };
                self.death_pings += 1;
                Some(transition)
            }
            HeartbeatState::Killed => None,
        }
    }

    fn push(&mut self, failed: bool) {
        if self.window.len() == self.capacity {
            if self.window.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
        self.window.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }
}

/// Classifies one probe outcome.
///
/// A transport or timeout error is a failure. A successful response counts
/// as healthy only when it carries no payload or the payload is boolean
/// `true`; any other payload is a failure. A custom probe whose call
/// returns its verdict wrapped in a result tuple must unwrap it itself.
pub fn probe_failed(outcome: &ClientResult<Response>) -> bool {
    let resp = match outcome {
        Ok(resp) => resp,
        Err(_) => return true,
    };
    match resp.data() {
        None => false,
        Some(Value::Boolean(ok)) => !ok,
        Some(_) => true,
    }
}

/// Future returned by a health probe.
pub type ProbeFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ClientResult<Response>> + Send>>;

/// Pluggable health probe. The probe owns its own deadline; a probe that
/// can hang forever will stall its entry's heartbeat.
pub type HealthProbe = std::sync::Arc<dyn Fn(Connection) -> ProbeFuture + Send + Sync>;

/// The default probe: one ping, bounded by `timeout`.
pub fn ping_probe(timeout: Duration) -> HealthProbe {
    std::sync::Arc::new(move |conn: Connection| {
        Box::pin(async move {
            conn.request(&boxproto_wire::Request::Ping, timeout).await
        })
    })
}
