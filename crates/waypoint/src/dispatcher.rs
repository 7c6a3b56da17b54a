//! Merged matchmaking surface over both backends.
//!
//! The dispatcher routes each join descriptor to the backend its variant
//! names and resolves dedicated hostnames through the [`DnsCache`]. It keeps
//! its own caches keyed by peer, entity and resolved endpoint. Results for one
//! server reached through different descriptors converge once a probe reports
//! the server's endpoint or hosting peer.
//!
//! Backend callbacks are wrapped so every completed probe is also sent to the
//! dispatcher, which writes it through to its caches on the next `tick`.

use crate::backend::{
    connect_target_from, should_replace, ConnectTarget, EntitySessionBackend, MatchmakingBackend,
    PeerLobbyBackend, PingCallback, PingStatus, RefreshFlags,
};
use crate::clock::SharedClock;
use crate::dns::{normalize, DnsCache, HostLookup};
use crate::error::MatchmakingResult;
use crate::types::{BackendKind, CachedServerEntry, EntityId, JoinDescriptor, PeerId, SessionDescriptor};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Receives the resolved address of a dedicated descriptor, or `None` when
/// the host has no routable address.
pub type AddressCallback = Box<dyn FnOnce(Option<SocketAddr>) + Send>;

const EVENT_CAPACITY: usize = 256;

/// Notifications published to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakingEvent {
    /// A backend's public list was replaced.
    ListUpdated(BackendKind),
    /// New data was recorded for a descriptor.
    ServerUpdated(JoinDescriptor),
    /// A hostname lookup settled.
    HostResolved { host: String, lookup: HostLookup },
}

enum Waiter {
    Ping(JoinDescriptor, PingCallback),
    Address(u16, AddressCallback),
}

type Completion = (JoinDescriptor, SessionDescriptor);

fn put<K: Eq + Hash>(cache: &mut HashMap<K, SessionDescriptor>, key: K, snapshot: &SessionDescriptor) -> bool {
    if should_replace(cache.get(&key), snapshot) {
        cache.insert(key, snapshot.clone());
        true
    } else {
        false
    }
}

pub struct MatchmakingDispatcher {
    peer: PeerLobbyBackend,
    entity: EntitySessionBackend,
    dns: DnsCache,
    clock: SharedClock,
    peer_cache: HashMap<PeerId, SessionDescriptor>,
    entity_cache: HashMap<EntityId, SessionDescriptor>,
    endpoint_cache: HashMap<SocketAddr, SessionDescriptor>,
    /// Requests parked until their host resolves, keyed by normalized host
    waiting_on_dns: HashMap<String, Vec<Waiter>>,
    /// Callbacks answered without network work, run on the next tick
    ready: Vec<(PingCallback, SessionDescriptor)>,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    events: broadcast::Sender<MatchmakingEvent>,
    peer_revision: u64,
    entity_revision: u64,
}

impl MatchmakingDispatcher {
    pub fn new(
        peer: PeerLobbyBackend,
        entity: EntitySessionBackend,
        dns: DnsCache,
        clock: SharedClock,
    ) -> Self {
        let (completions_tx, completions_rx) = unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peer,
            entity,
            dns,
            clock,
            peer_cache: HashMap::new(),
            entity_cache: HashMap::new(),
            endpoint_cache: HashMap::new(),
            waiting_on_dns: HashMap::new(),
            ready: Vec::new(),
            completions_tx,
            completions_rx,
            events,
            peer_revision: 0,
            entity_revision: 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent> {
        self.events.subscribe()
    }

    /// The backend serving `kind`. Dedicated servers are queried through the
    /// peer-lobby provider.
    pub fn backend(&self, kind: BackendKind) -> &dyn MatchmakingBackend {
        match kind {
            BackendKind::EntitySessionUser => &self.entity,
            BackendKind::PeerUser | BackendKind::Dedicated => &self.peer,
        }
    }

    pub fn backend_mut(&mut self, kind: BackendKind) -> &mut dyn MatchmakingBackend {
        match kind {
            BackendKind::EntitySessionUser => &mut self.entity,
            BackendKind::PeerUser | BackendKind::Dedicated => &mut self.peer,
        }
    }

    pub fn peer_lobby(&self) -> &PeerLobbyBackend {
        &self.peer
    }

    pub fn entity_session(&self) -> &EntitySessionBackend {
        &self.entity
    }

    pub fn entity_session_mut(&mut self) -> &mut EntitySessionBackend {
        &mut self.entity
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    pub fn refresh(&mut self, kind: BackendKind, flags: RefreshFlags) -> MatchmakingResult<()> {
        self.backend_mut(kind).refresh_public_list(flags)
    }

    pub fn public_list(&self, kind: BackendKind) -> &[CachedServerEntry] {
        self.backend(kind).public_list()
    }

    fn dedicated_addr(&self, target: &JoinDescriptor) -> Option<SocketAddr> {
        let JoinDescriptor::Dedicated { host, port } = target else {
            return None;
        };
        self.dns
            .lookup_cached(host)
            .address()
            .map(|ip| SocketAddr::new(ip, *port))
    }

    /// Newest snapshot known for `target` captured strictly after
    /// `newer_than`. Never starts network work; an unresolved hostname has
    /// no data yet.
    pub fn cached_data(&self, target: &JoinDescriptor, newer_than: DateTime<Utc>) -> Option<SessionDescriptor> {
        let (own, from_backend) = match target {
            JoinDescriptor::PeerUser { peer_id } => {
                (self.peer_cache.get(peer_id), self.peer.cached_data(target, newer_than))
            }
            JoinDescriptor::EntitySessionUser { remote_entity_id } => (
                self.entity_cache.get(remote_entity_id),
                self.entity.cached_data(target, newer_than),
            ),
            JoinDescriptor::Dedicated { .. } => match self.dedicated_addr(target) {
                Some(addr) => (
                    self.endpoint_cache.get(&addr),
                    self.peer
                        .cached_data(&JoinDescriptor::from_socket_addr(addr), newer_than),
                ),
                None => (None, None),
            },
        };

        own.filter(|snapshot| snapshot.is_newer_than(newer_than))
            .cloned()
            .into_iter()
            .chain(from_backend)
            .max_by_key(|snapshot| snapshot.captured_at)
    }

    /// Records externally learned data in both the backend and the dispatcher.
    pub fn cache_data(&mut self, target: &JoinDescriptor, snapshot: SessionDescriptor) {
        match target {
            JoinDescriptor::Dedicated { .. } => {
                if let Some(addr) = self.dedicated_addr(target) {
                    self.peer
                        .cache_data(&JoinDescriptor::from_socket_addr(addr), snapshot.clone());
                }
            }
            JoinDescriptor::PeerUser { .. } => self.peer.cache_data(target, snapshot.clone()),
            JoinDescriptor::EntitySessionUser { .. } => self.entity.cache_data(target, snapshot.clone()),
        }
        if self.record(target, &snapshot) {
            let _ = self.events.send(MatchmakingEvent::ServerUpdated(target.clone()));
        }
    }

    /// Probes `target` through its backend.
    ///
    /// Dedicated hostnames that have not resolved yet park the ping until DNS
    /// settles; a host without a routable address answers "none" on the next
    /// tick.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not a valid descriptor.
    pub fn ping(&mut self, target: &JoinDescriptor, callback: PingCallback) -> PingStatus {
        assert!(target.is_valid(), "cannot ping invalid descriptor {target:?}");

        match target {
            JoinDescriptor::PeerUser { .. } => {
                let callback = self.recording(target, callback);
                self.peer.ping(target, callback)
            }
            JoinDescriptor::EntitySessionUser { .. } => {
                let callback = self.recording(target, callback);
                self.entity.ping(target, callback)
            }
            JoinDescriptor::Dedicated { host, port } => match self.dns.resolve(host) {
                HostLookup::Resolved(ip) => {
                    let resolved = JoinDescriptor::from_socket_addr(SocketAddr::new(ip, *port));
                    let callback = self.recording(target, callback);
                    self.peer.ping(&resolved, callback)
                }
                HostLookup::NotQueried | HostLookup::Pending => {
                    let waiters = self.waiting_on_dns.entry(normalize(host)).or_default();
                    let coalesced = waiters
                        .iter()
                        .any(|w| matches!(w, Waiter::Ping(t, _) if t == target));
                    waiters.push(Waiter::Ping(target.clone(), callback));
                    if coalesced {
                        PingStatus::Coalesced
                    } else {
                        debug!(%target, "Ping waiting for DNS");
                        PingStatus::Dispatched
                    }
                }
                HostLookup::Unroutable | HostLookup::Unresolvable => {
                    debug!(%target, "Host has no routable address, reporting no data");
                    self.ready.push((callback, SessionDescriptor::none(self.clock.now())));
                    PingStatus::Dispatched
                }
            },
        }
    }

    /// Resolves the address of a dedicated descriptor, invoking `callback`
    /// immediately when it is already known.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not a dedicated descriptor.
    pub fn get_server_ip_async(&mut self, target: &JoinDescriptor, callback: AddressCallback) {
        let JoinDescriptor::Dedicated { host, port } = target else {
            panic!("address lookup needs a dedicated descriptor, got {target}");
        };
        match self.dns.resolve(host) {
            HostLookup::NotQueried | HostLookup::Pending => self
                .waiting_on_dns
                .entry(normalize(host))
                .or_default()
                .push(Waiter::Address(*port, callback)),
            lookup => callback(lookup.address().map(|ip| SocketAddr::new(ip, *port))),
        }
    }

    /// Where joining `target` connects to, from what is already known.
    pub fn resolve_join_target(&self, target: &JoinDescriptor) -> Option<ConnectTarget> {
        match target {
            JoinDescriptor::Dedicated { .. } => self.dedicated_addr(target).map(ConnectTarget::Address),
            JoinDescriptor::PeerUser { peer_id } => {
                connect_target_from(self.peer_cache.get(peer_id), ConnectTarget::Peer(*peer_id))
                    .or_else(|| self.peer.resolve_join_target(target))
            }
            JoinDescriptor::EntitySessionUser { remote_entity_id } => connect_target_from(
                self.entity_cache.get(remote_entity_id),
                ConnectTarget::Entity(remote_entity_id.clone()),
            )
            .or_else(|| self.entity.resolve_join_target(target)),
        }
    }

    pub fn tick(&mut self, dt: Duration) {
        self.peer.tick(dt);
        self.entity.tick(dt);

        for (host, lookup) in self.dns.tick() {
            info!("🌐 Resolved {}: {:?}", host, lookup);
            let waiters = self.waiting_on_dns.remove(&host).unwrap_or_default();
            let _ = self.events.send(MatchmakingEvent::HostResolved { host, lookup });
            for waiter in waiters {
                match waiter {
                    Waiter::Ping(target, callback) => self.resume_ping(&target, callback),
                    Waiter::Address(port, callback) => {
                        callback(lookup.address().map(|ip| SocketAddr::new(ip, port)))
                    }
                }
            }
        }

        for (callback, snapshot) in std::mem::take(&mut self.ready) {
            callback(&snapshot);
        }

        while let Ok((target, snapshot)) = self.completions_rx.try_recv() {
            if self.record(&target, &snapshot) {
                let _ = self.events.send(MatchmakingEvent::ServerUpdated(target));
            }
        }

        self.sync_list(BackendKind::PeerUser);
        self.sync_list(BackendKind::EntitySessionUser);
    }

    /// Wraps `callback` so the result also reaches the dispatcher caches.
    fn recording(&self, target: &JoinDescriptor, callback: PingCallback) -> PingCallback {
        let tx = self.completions_tx.clone();
        let target = target.clone();
        Box::new(move |snapshot: &SessionDescriptor| {
            let _ = tx.send((target, snapshot.clone()));
            callback(snapshot);
        })
    }

    /// Re-issues a ping parked on DNS. The caller was already told the ping
    /// was scheduled, so a rejection still answers "none".
    fn resume_ping(&mut self, target: &JoinDescriptor, callback: PingCallback) {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let inner = slot.clone();
        let status = self.ping(
            target,
            Box::new(move |snapshot: &SessionDescriptor| {
                let callback = inner.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(callback) = callback {
                    callback(snapshot);
                }
            }),
        );

        if let PingStatus::Rejected(e) = status {
            debug!(%target, "Parked ping rejected: {}", e);
            let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(callback) = callback {
                self.ready.push((callback, SessionDescriptor::none(self.clock.now())));
            }
        }
    }

    /// Writes a snapshot under its own key and under every key it reveals.
    fn record(&mut self, target: &JoinDescriptor, snapshot: &SessionDescriptor) -> bool {
        let mut changed = match target {
            JoinDescriptor::PeerUser { peer_id } => put(&mut self.peer_cache, *peer_id, snapshot),
            JoinDescriptor::EntitySessionUser { remote_entity_id } => {
                put(&mut self.entity_cache, remote_entity_id.clone(), snapshot)
            }
            JoinDescriptor::Dedicated { .. } => match self.dedicated_addr(target) {
                Some(addr) => put(&mut self.endpoint_cache, addr, snapshot),
                None => false,
            },
        };

        if let Some(info) = snapshot.info.as_ref() {
            if let Some(addr) = info.endpoint {
                changed |= put(&mut self.endpoint_cache, addr, snapshot);
            }
            if let Some(peer) = info.host_peer {
                changed |= put(&mut self.peer_cache, peer, snapshot);
            }
        }
        changed
    }

    fn sync_list(&mut self, kind: BackendKind) {
        let changed = match kind {
            BackendKind::EntitySessionUser => self.entity.list_revision_changed(&mut self.entity_revision),
            _ => self.peer.list_revision_changed(&mut self.peer_revision),
        };
        if !changed {
            return;
        }

        let entries = self.backend(kind).public_list().to_vec();
        for entry in &entries {
            self.record(&entry.descriptor, &entry.data);
        }
        info!("📋 {} list updated: {} servers", kind, entries.len());
        let _ = self.events.send(MatchmakingEvent::ListUpdated(kind));
    }
}
