//! Tagged groups of self-healing connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use boxproto_client::{AuthMethod, ClientConfig};

use crate::entry::{PoolCounters, PoolEntry, PoolGet};
use crate::error::{PoolError, PoolResult};
use crate::heartbeat::{ping_probe, HealthProbe, HeartbeatParams};

/// Declarative description of one group: an endpoint, credentials, and how
/// many connections to keep open to it.
#[derive(Debug, Clone)]
pub struct InstanceGroup {
    /// Name callers use to address the group.
    pub tag: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: String,
    pub auth_method: AuthMethod,
    /// Number of slots.
    pub size: usize,
}

impl InstanceGroup {
    pub fn new(tag: &str, host: &str, port: u16, size: usize) -> InstanceGroup {
        InstanceGroup {
            tag: tag.to_string(),
            host: host.to_string(),
            port,
            user: None,
            password: String::new(),
            auth_method: AuthMethod::default(),
            size,
        }
    }

    fn validate(&self) -> PoolResult<()> {
        if self.tag.is_empty() {
            return Err(PoolError::Config("group tag must not be empty".into()));
        }
        if self.host.is_empty() || self.port == 0 {
            return Err(PoolError::Config(format!(
                "group {:?} has no usable endpoint",
                self.tag
            )));
        }
        Ok(())
    }

    /// Whether `other` describes the same server and credentials, so that
    /// existing connections remain valid under the new description.
    fn same_endpoint(&self, other: &InstanceGroup) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.user == other.user
            && self.password == other.password
            && self.auth_method == other.auth_method
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            auth_method: self.auth_method,
            ..Default::default()
        }
    }
}

struct PoolState {
    groups: HashMap<String, InstanceGroup>,
    entries: HashMap<String, Vec<PoolEntry>>,
}

/// A set of tagged instance groups, each slot kept alive by its own
/// lifecycle task.
///
/// `get` never blocks on connection establishment: a slot that is
/// invalidated, mid-connect, or waiting out its reconnect delay reports
/// [`PoolGet::Unavailable`] immediately.
pub struct Pool {
    state: Mutex<PoolState>,
    counters: Arc<PoolCounters>,
    params: HeartbeatParams,
    probe: HealthProbe,
    closed: AtomicBool,
}

impl Pool {
    /// An empty pool with the default ping probe. Populate it with
    /// [`Pool::set_groups`].
    pub fn new(params: HeartbeatParams) -> PoolResult<Pool> {
        let probe = ping_probe(params.ping_interval);
        Pool::with_probe(params, probe)
    }

    /// An empty pool with a caller-supplied health probe. The probe owns
    /// its own deadline.
    pub fn with_probe(params: HeartbeatParams, probe: HealthProbe) -> PoolResult<Pool> {
        params.validate()?;
        Ok(Pool {
            state: Mutex::new(PoolState {
                groups: HashMap::new(),
                entries: HashMap::new(),
            }),
            counters: Arc::new(PoolCounters::default()),
            params,
            probe,
            closed: AtomicBool::new(false),
        })
    }

    /// Reconciles the pool against a new set of group descriptions.
    ///
    /// Unknown tags get fresh slots; a known tag with an unchanged endpoint
    /// is resized by growing or trimming its tail; a known tag whose
    /// endpoint or credentials changed has every old slot closed before any
    /// new one is created; tags absent from `groups` are closed and removed.
    pub async fn set_groups(&self, groups: Vec<InstanceGroup>) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        for group in &groups {
            group.validate()?;
        }
        {
            let mut seen = HashSet::new();
            for group in &groups {
                if !seen.insert(group.tag.as_str()) {
                    return Err(PoolError::Config(format!(
                        "duplicate group tag {:?}",
                        group.tag
                    )));
                }
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let keep: HashSet<&str> = groups.iter().map(|g| g.tag.as_str()).collect();
        let stale: Vec<String> = state
            .groups
            .keys()
            .filter(|tag| !keep.contains(tag.as_str()))
            .cloned()
            .collect();
        for tag in stale {
            info!(%tag, "removing group");
            state.groups.remove(&tag);
            if let Some(entries) = state.entries.remove(&tag) {
                self.close_entries(entries);
            }
        }

        for group in groups {
            let tag = group.tag.clone();
            match state.groups.get(&tag) {
                Some(old) if old.same_endpoint(&group) => {
                    let entries = state.entries.entry(tag.clone()).or_default();
                    if group.size > entries.len() {
                        info!(%tag, from = entries.len(), to = group.size, "growing group");
                        for index in entries.len()..group.size {
                            entries.push(self.spawn_entry(&group, index));
                        }
                    } else if group.size < entries.len() {
                        info!(%tag, from = entries.len(), to = group.size, "shrinking group");
                        let trimmed: Vec<PoolEntry> = entries.drain(group.size..).collect();
                        self.close_entries(trimmed);
                    }
                }
                Some(_) => {
                    // Endpoint or credentials changed: the old connections
                    // are all wrong now. Close every one before creating
                    // replacements.
                    info!(%tag, "group endpoint changed, recreating");
                    if let Some(entries) = state.entries.remove(&tag) {
                        self.close_entries(entries);
                    }
                    let entries = (0..group.size)
                        .map(|index| self.spawn_entry(&group, index))
                        .collect();
                    state.entries.insert(tag.clone(), entries);
                }
                None => {
                    info!(%tag, size = group.size, "adding group");
                    let entries = (0..group.size)
                        .map(|index| self.spawn_entry(&group, index))
                        .collect();
                    state.entries.insert(tag.clone(), entries);
                }
            }
            state.groups.insert(tag, group);
        }
        Ok(())
    }

    /// Fetches slot `index` of group `tag`.
    ///
    /// `Err` means the address is wrong or the pool is closed;
    /// [`PoolGet::Unavailable`] means the slot exists but has no healthy
    /// connection right now.
    pub async fn get(&self, tag: &str, index: usize) -> PoolResult<PoolGet> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let state = self.state.lock().await;
        let entries = state
            .entries
            .get(tag)
            .ok_or_else(|| PoolError::NotFound(format!("no group tagged {tag:?}")))?;
        let entry = entries.get(index).ok_or_else(|| {
            PoolError::NotFound(format!(
                "group {tag:?} has {} slots, asked for index {index}",
                entries.len()
            ))
        })?;
        Ok(entry.get())
    }

    /// Current slot count of one group.
    pub async fn group_size(&self, tag: &str) -> PoolResult<usize> {
        let state = self.state.lock().await;
        state
            .entries
            .get(tag)
            .map(Vec::len)
            .ok_or_else(|| PoolError::NotFound(format!("no group tagged {tag:?}")))
    }

    /// Slots with no healthy connection to hand out.
    pub fn unavailable(&self) -> usize {
        self.counters.unavailable.load(Ordering::SeqCst)
    }

    /// Slots currently waiting out the reconnect delay.
    pub fn reconnecting(&self) -> usize {
        self.counters.reconnecting.load(Ordering::SeqCst)
    }

    /// Slots across all groups.
    pub fn total_size(&self) -> usize {
        self.counters.total.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every slot and empties the pool. Idempotent; later calls and
    /// later `get`/`set_groups` see [`PoolError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        state.groups.clear();
        for (tag, entries) in state.entries.drain() {
            info!(%tag, "closing group");
            self.close_entries(entries);
        }
    }

    fn spawn_entry(&self, group: &InstanceGroup, index: usize) -> PoolEntry {
        self.counters.total.fetch_add(1, Ordering::SeqCst);
        PoolEntry::spawn(
            &group.tag,
            index,
            group.client_config(),
            self.params.clone(),
            self.probe.clone(),
            self.counters.clone(),
        )
    }

    fn close_entries(&self, entries: Vec<PoolEntry>) {
        for entry in entries {
            entry.shutdown();
            self.counters.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("total", &self.total_size())
            .field("unavailable", &self.unavailable())
            .field("reconnecting", &self.reconnecting())
            .field("closed", &self.is_closed())
            .finish()
    }
}
