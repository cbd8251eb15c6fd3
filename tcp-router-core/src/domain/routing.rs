//! Routing table mapping external listener ports to backend pools.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::backend::{BackendAddr, BackendEndpoint};
use crate::domain::event::RoutingEvent;

/// Identifies one externally exposed TCP listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RoutingKey {
    /// External listening port.
    pub port: u16,
}

impl RoutingKey {
    /// Create a routing key for a listening port.
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)
    }
}

/// The authoritative listener/backend list returned by a full sync.
pub type DesiredRoutes = BTreeMap<RoutingKey, Vec<BackendEndpoint>>;

#[derive(Debug, Clone)]
struct BackendEntry {
    endpoint: BackendEndpoint,
    expires_at: Instant,
}

impl BackendEntry {
    fn observed(endpoint: BackendEndpoint, now: Instant, default_ttl: Duration) -> Self {
        let expires_at = now + endpoint.effective_ttl(default_ttl);
        Self {
            endpoint,
            expires_at,
        }
    }

    /// Record a fresh observation. The expiry never moves backwards.
    fn refresh(&mut self, endpoint: BackendEndpoint, now: Instant, default_ttl: Duration) {
        let expires_at = now + endpoint.effective_ttl(default_ttl);
        self.expires_at = self.expires_at.max(expires_at);
        self.endpoint = endpoint;
    }
}

/// The backends currently believed to serve one listener.
///
/// Membership is keyed by `(host, port)`; each member carries its own expiry clock.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    members: BTreeMap<BackendAddr, BackendEntry>,
}

impl BackendSet {
    /// Number of backends.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the listener has no backends.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the address is a member.
    pub fn contains(&self, addr: &BackendAddr) -> bool {
        self.members.contains_key(addr)
    }

    /// Iterate members in address order.
    pub fn endpoints(&self) -> impl Iterator<Item = &BackendEndpoint> {
        self.members.values().map(|entry| &entry.endpoint)
    }

    /// The instant at which the member stops being considered fresh.
    pub fn expires_at(&self, addr: &BackendAddr) -> Option<Instant> {
        self.members.get(addr).map(|entry| entry.expires_at)
    }

    fn same_members(&self, other: &BackendSet) -> bool {
        self.members.keys().eq(other.members.keys())
    }

    fn upsert(&mut self, endpoint: BackendEndpoint, now: Instant, default_ttl: Duration) -> bool {
        match self.members.entry(endpoint.addr()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry
                    .endpoint
                    .modification_tag
                    .succeeded_by(&endpoint.modification_tag)
                {
                    entry.refresh(endpoint, now, default_ttl);
                }
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BackendEntry::observed(endpoint, now, default_ttl));
                true
            }
        }
    }

    fn remove(&mut self, endpoint: &BackendEndpoint) -> bool {
        let addr = endpoint.addr();
        let superseded = self.members.get(&addr).is_some_and(|entry| {
            entry
                .endpoint
                .modification_tag
                .succeeded_by(&endpoint.modification_tag)
        });
        if superseded {
            self.members.remove(&addr);
        }
        superseded
    }

    fn expire(&mut self, now: Instant) -> bool {
        let before = self.members.len();
        self.members.retain(|_, entry| entry.expires_at > now);
        self.members.len() != before
    }

    /// Insert an entry built during a full sync, keeping the newer of two duplicates.
    fn merge(&mut self, entry: BackendEntry) {
        match self.members.entry(entry.endpoint.addr()) {
            Entry::Occupied(mut occupied) => {
                if occupied
                    .get()
                    .endpoint
                    .modification_tag
                    .succeeded_by(&entry.endpoint.modification_tag)
                {
                    occupied.insert(entry);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }
}

/// Desired mapping from listener to backend set.
///
/// Owned by a single writer; readers receive [`RoutingSnapshot`]s.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: BTreeMap<RoutingKey, BackendSet>,
    default_ttl: Duration,
}

impl RoutingTable {
    /// Create an empty table. `default_ttl` applies to endpoints registered without a TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_ttl,
        }
    }

    /// The TTL used for endpoints that carry none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listener is configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The backend set of a listener.
    pub fn backends(&self, key: &RoutingKey) -> Option<&BackendSet> {
        self.entries.get(key)
    }

    /// Insert or refresh an endpoint under `key`.
    ///
    /// Returns whether membership changed. Refreshing a present endpoint only extends its
    /// expiry, and an update whose tag does not succeed the stored one is ignored.
    pub fn upsert(&mut self, key: RoutingKey, endpoint: BackendEndpoint, now: Instant) -> bool {
        let default_ttl = self.default_ttl;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => occupied.get_mut().upsert(endpoint, now, default_ttl),
            Entry::Vacant(vacant) => {
                vacant
                    .insert(BackendSet::default())
                    .upsert(endpoint, now, default_ttl);
                true
            }
        }
    }

    /// Remove an endpoint from `key`. The listener stays configured when its set empties.
    pub fn remove(&mut self, key: RoutingKey, endpoint: &BackendEndpoint) -> bool {
        self.entries
            .get_mut(&key)
            .is_some_and(|set| set.remove(endpoint))
    }

    /// Remove the listener entirely.
    pub fn remove_key(&mut self, key: RoutingKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Replace the table contents with `desired`.
    ///
    /// Endpoints present on both sides keep their expiry unless the desired entry carries a
    /// strictly newer modification tag; a stored entry newer than the desired one is kept
    /// as is. Returns the listeners whose membership differs from before.
    pub fn replace_all(&mut self, desired: DesiredRoutes, now: Instant) -> BTreeSet<RoutingKey> {
        let mut next = BTreeMap::new();

        for (key, endpoints) in desired {
            let previous = self.entries.get(&key);
            let mut set = BackendSet::default();

            for endpoint in endpoints {
                let existing = previous.and_then(|prev| prev.members.get(&endpoint.addr()));
                let entry = match existing {
                    Some(existing) => {
                        let stored = &existing.endpoint.modification_tag;
                        let mut entry = existing.clone();
                        if stored != &endpoint.modification_tag
                            && stored.succeeded_by(&endpoint.modification_tag)
                        {
                            entry.refresh(endpoint, now, self.default_ttl);
                        }
                        entry
                    }
                    None => BackendEntry::observed(endpoint, now, self.default_ttl),
                };
                set.merge(entry);
            }

            next.insert(key, set);
        }

        let changed = changed_keys(&self.entries, &next);
        self.entries = next;
        changed
    }

    /// Remove every endpoint whose expiry is at or before `now`.
    ///
    /// Listeners are retained even when all their endpoints expire.
    pub fn expire_stale(&mut self, now: Instant) -> BTreeSet<RoutingKey> {
        self.entries
            .iter_mut()
            .filter_map(|(key, set)| set.expire(now).then_some(*key))
            .collect()
    }

    /// Apply a registry event. Returns whether membership changed.
    pub fn apply(&mut self, event: RoutingEvent, now: Instant) -> bool {
        match event {
            RoutingEvent::EndpointAdded { key, endpoint } => self.upsert(key, endpoint, now),
            RoutingEvent::EndpointRemoved { key, endpoint } => self.remove(key, &endpoint),
            RoutingEvent::KeyRemoved { key } => self.remove_key(key),
        }
    }

    /// An immutable copy of the current contents.
    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            routes: self
                .entries
                .iter()
                .map(|(key, set)| (*key, set.endpoints().cloned().collect()))
                .collect(),
        }
    }
}

fn changed_keys(
    before: &BTreeMap<RoutingKey, BackendSet>,
    after: &BTreeMap<RoutingKey, BackendSet>,
) -> BTreeSet<RoutingKey> {
    let mut changed: BTreeSet<RoutingKey> = before
        .iter()
        .filter(|(key, set)| !after.get(*key).is_some_and(|next| next.same_members(set)))
        .map(|(key, _)| *key)
        .collect();
    changed.extend(after.keys().filter(|key| !before.contains_key(*key)));
    changed
}

/// Immutable view of the routing table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingSnapshot {
    routes: BTreeMap<RoutingKey, Vec<BackendEndpoint>>,
}

impl RoutingSnapshot {
    /// Iterate listeners in port order with their backends in address order.
    pub fn listeners(&self) -> impl Iterator<Item = (&RoutingKey, &[BackendEndpoint])> {
        self.routes
            .iter()
            .map(|(key, backends)| (key, backends.as_slice()))
    }

    /// The backends of a listener.
    pub fn backends(&self, key: &RoutingKey) -> Option<&[BackendEndpoint]> {
        self.routes.get(key).map(Vec::as_slice)
    }

    /// Whether the listener is configured.
    pub fn contains_key(&self, key: &RoutingKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no listener is configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Total number of backends across all listeners.
    pub fn backend_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

/// Lock-free publication point for the latest routing snapshot.
///
/// Uses `ArcSwap` so readers (configurer, admin endpoint) never block the writer and
/// never observe a table mid-mutation.
#[derive(Debug, Default)]
pub struct RoutingTableView {
    current: ArcSwap<RoutingSnapshot>,
}

impl RoutingTableView {
    /// Create a view holding an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the published snapshot.
    pub fn publish(&self, snapshot: RoutingSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }
}

/// A shared reference to the published routing view.
pub type SharedRoutingTableView = Arc<RoutingTableView>;

#[cfg(test)]
#[path = "routing_tests.rs"]
mod routing_tests;
