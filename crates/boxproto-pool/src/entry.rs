//! One pool slot: connection, heartbeat, reconnect loop.
//!
//! Each entry runs a background task that owns the slot's whole lifecycle:
//! connect, serve heartbeats, tear down on kill or socket loss, wait the
//! fixed reconnect delay, connect again. The entry is "locked" whenever it
//! has no healthy connection to hand out; [`Pool::get`](crate::Pool::get)
//! turns a locked entry into [`PoolGet::Unavailable`] rather than an error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use boxproto_client::{ClientConfig, Connection};

use crate::heartbeat::{probe_failed, HealthProbe, Heartbeat, HeartbeatParams, Transition};

/// Outcome of [`Pool::get`](crate::Pool::get) for an existing slot.
#[derive(Debug, Clone)]
pub enum PoolGet {
    /// A healthy connection. Cheap clone of the slot's connection; requests
    /// on it multiplex with the heartbeat's own probes.
    Ready(Connection),
    /// The slot exists but is invalidated or between connections. Not an
    /// error: retry later or fail over to another slot.
    Unavailable,
}

/// Pool-wide gauges, shared by every entry.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    /// Locked slots: invalidated, mid-connect, or waiting to reconnect.
    pub unavailable: AtomicUsize,
    /// Slots currently sitting out the reconnect delay.
    pub reconnecting: AtomicUsize,
    /// All slots across all groups.
    pub total: AtomicUsize,
}

pub(crate) struct EntryShared {
    tag: String,
    index: usize,
    locked: AtomicBool,
    conn: StdMutex<Option<Connection>>,
    counters: Arc<PoolCounters>,
}

impl EntryShared {
    /// Marks the slot unavailable. The flag guards the gauge, so repeated
    /// locking never double-counts.
    fn lock_slot(&self) {
        if !self.locked.swap(true, Ordering::SeqCst) {
            self.counters.unavailable.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unlock_slot(&self) {
        if self.locked.swap(false, Ordering::SeqCst) {
            self.counters.unavailable.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn set_conn(&self, conn: Connection) {
        *self.conn.lock().expect("conn mutex poisoned") = Some(conn);
    }

    fn take_conn(&self) -> Option<Connection> {
        self.conn.lock().expect("conn mutex poisoned").take()
    }

    fn clone_conn(&self) -> Option<Connection> {
        self.conn.lock().expect("conn mutex poisoned").clone()
    }
}

/// Handle to one slot and its lifecycle task.
pub(crate) struct PoolEntry {
    shared: Arc<EntryShared>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PoolEntry {
    /// Creates the slot locked and spawns its lifecycle task.
    pub(crate) fn spawn(
        tag: &str,
        index: usize,
        config: ClientConfig,
        params: HeartbeatParams,
        probe: HealthProbe,
        counters: Arc<PoolCounters>,
    ) -> PoolEntry {
        let shared = Arc::new(EntryShared {
            tag: tag.to_string(),
            index,
            locked: AtomicBool::new(false),
            conn: StdMutex::new(None),
            counters,
        });
        // Locked before the task runs, so a get() racing the spawn sees
        // Unavailable rather than an unlocked empty slot.
        shared.lock_slot();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_entry(config, params, probe, shared.clone(), shutdown_rx));
        PoolEntry {
            shared,
            shutdown_tx,
            handle,
        }
    }

    pub(crate) fn get(&self) -> PoolGet {
        if self.shared.is_locked() {
            return PoolGet::Unavailable;
        }
        match self.shared.clone_conn() {
            Some(conn) => PoolGet::Ready(conn),
            None => PoolGet::Unavailable,
        }
    }

    /// Stops the lifecycle task and closes the slot's connection.
    ///
    /// Closes the stored connection and releases the lock gauge right here;
    /// the aborted task's own cleanup covers whatever it was holding at the
    /// await point the abort landed on (a reconnect-delay gauge, or a
    /// connection established after this call's `take_conn`).
    pub(crate) fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        if let Some(conn) = self.shared.take_conn() {
            conn.close();
        }
        self.shared.unlock_slot();
    }
}

/// Why one served connection ended.
enum Exit {
    Shutdown,
    Lost,
    Killed,
}

/// Terminal cleanup for the lifecycle task. The task is cancelled with
/// `abort()`, which can land on any await point, so closing a stored
/// connection and releasing the slot's gauge must not depend on the task
/// reaching a return statement.
struct EntryCleanup {
    shared: Arc<EntryShared>,
}

impl Drop for EntryCleanup {
    fn drop(&mut self) {
        if let Some(conn) = self.shared.take_conn() {
            conn.close();
        }
        self.shared.unlock_slot();
    }
}

/// Holds the `reconnecting` gauge for the duration of one reconnect delay,
/// releasing it on drop so a cancelled sleep still restores the count.
struct ReconnectGauge<'a> {
    counters: &'a PoolCounters,
}

impl<'a> ReconnectGauge<'a> {
    fn hold(counters: &'a PoolCounters) -> Self {
        counters.reconnecting.fetch_add(1, Ordering::SeqCst);
        ReconnectGauge { counters }
    }
}

impl Drop for ReconnectGauge<'_> {
    fn drop(&mut self) {
        self.counters.reconnecting.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_entry(
    config: ClientConfig,
    params: HeartbeatParams,
    probe: HealthProbe,
    shared: Arc<EntryShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _cleanup = EntryCleanup {
        shared: shared.clone(),
    };
    loop {
        if *shutdown.borrow() {
            return;
        }
        shared.lock_slot();

        let attempt = tokio::select! {
            result = Connection::connect(&config) => result,
            _ = shutdown.changed() => return,
        };
        match attempt {
            Ok(conn) => {
                info!(
                    tag = %shared.tag,
                    index = shared.index,
                    peer = conn.peer(),
                    "instance connected"
                );
                shared.set_conn(conn.clone());
                shared.unlock_slot();

                let exit = serve(&conn, &params, &probe, &shared, &mut shutdown).await;
                shared.take_conn();
                conn.close();
                shared.lock_slot();
                match exit {
                    Exit::Shutdown => return,
                    Exit::Lost => {
                        warn!(tag = %shared.tag, index = shared.index, "connection lost")
                    }
                    Exit::Killed => {
                        warn!(tag = %shared.tag, index = shared.index, "connection killed")
                    }
                }
            }
            Err(e) => {
                warn!(
                    tag = %shared.tag,
                    index = shared.index,
                    error = %e,
                    "connect failed"
                );
            }
        }

        let gauge = ReconnectGauge::hold(&shared.counters);
        let stop = tokio::select! {
            _ = tokio::time::sleep(params.reconnect_after) => false,
            _ = shutdown.changed() => true,
        };
        drop(gauge);
        if stop {
            return;
        }
    }
}

/// Drives the heartbeat over one established connection until it is killed,
/// lost, or the pool shuts down.
async fn serve(
    conn: &Connection,
    params: &HeartbeatParams,
    probe: &HealthProbe,
    shared: &EntryShared,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let mut hb = Heartbeat::seeded(params);
    let mut closed = conn.closed();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Exit::Shutdown,
            _ = closed.changed() => return Exit::Lost,
            _ = tokio::time::sleep(params.ping_interval) => {
                let outcome = probe(conn.clone()).await;
                let failed = probe_failed(&outcome);
                match hb.record(failed) {
                    Some(Transition::Activate) => {
                        info!(tag = %shared.tag, index = shared.index, "instance recovered");
                        shared.unlock_slot();
                    }
                    Some(Transition::Invalidate) => {
                        if !shared.is_locked() {
                            warn!(
                                tag = %shared.tag,
                                index = shared.index,
                                failures = hb.failure_count(),
                                "instance invalidated"
                            );
                        }
                        shared.lock_slot();
                    }
                    Some(Transition::Kill) => {
                        shared.lock_slot();
                        return Exit::Killed;
                    }
                    None => debug!(
                        tag = %shared.tag,
                        index = shared.index,
                        failed,
                        "heartbeat tick"
                    ),
                }
            }
        }
    }
}
