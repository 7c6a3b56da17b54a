//! Peer-lobby backend.
//!
//! Discovery pulls the provider's full lobby list and filters it locally.
//! Every accepted list bumps a revision counter so callers can skip copying
//! an unchanged list. Pings fetch a single lobby by owner, or query a
//! dedicated server directly by its resolved address.

use super::pending::PendingPings;
use super::service::{LobbyRecord, PeerLobbyEvent, PeerLobbyService, RequestId};
use super::{
    connect_target_from, should_replace, ConnectTarget, MatchmakingBackend, PingCallback, PingStatus,
    RefreshFlags,
};
use crate::clock::SharedClock;
use crate::config::MatchmakingConfig;
use crate::error::{MatchmakingError, MatchmakingResult, ServiceError};
use crate::types::{BackendKind, CachedServerEntry, JoinDescriptor, PeerId, ServerInfo, SessionDescriptor};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Game version, network version and modifiers decoded from a lobby tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTags {
    pub game_version: String,
    /// 0 when the tag could not be parsed
    pub network_version: u32,
    pub modifiers: Vec<String>,
}

/// Parses `version|nv=N|mods=a,b`.
///
/// Anything that does not fit the format keeps the whole tag as the game
/// version with an unknown (0) network version, so the lobby is still listed
/// but never considered compatible.
pub fn parse_version_tags(tags: &str) -> VersionTags {
    let fallback = || VersionTags {
        game_version: tags.to_string(),
        network_version: 0,
        modifiers: Vec::new(),
    };

    let mut parts = tags.split('|');
    let game_version = match parts.next() {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return fallback(),
    };

    let mut network_version = None;
    let mut modifiers = Vec::new();
    for part in parts {
        match part.split_once('=') {
            Some(("nv", value)) => match value.parse::<u32>() {
                Ok(nv) => network_version = Some(nv),
                Err(_) => return fallback(),
            },
            Some(("mods", value)) => {
                modifiers = value
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => return fallback(),
        }
    }

    match network_version {
        Some(network_version) => VersionTags {
            game_version,
            network_version,
            modifiers,
        },
        None => fallback(),
    }
}

/// Inverse of [`parse_version_tags`], used by hosts advertising a lobby.
pub fn format_version_tags(game_version: &str, network_version: u32, modifiers: &[String]) -> String {
    let mut tags = format!("{game_version}|nv={network_version}");
    if !modifiers.is_empty() {
        tags.push_str("|mods=");
        tags.push_str(&modifiers.join(","));
    }
    tags
}

fn record_to_info(record: &LobbyRecord) -> ServerInfo {
    let tags = parse_version_tags(&record.tags);
    ServerInfo {
        name: record.name.clone(),
        player_count: record.player_count,
        max_players: record.max_players,
        host_id: record.host_id.clone(),
        host_peer: Some(record.owner),
        game_version: tags.game_version,
        network_version: tags.network_version,
        join_code: None,
        password_protected: record.password_protected,
        platform_restriction: record.platform_restriction,
        modifiers: tags.modifiers,
        endpoint: record.server_addr,
    }
}

/// Probe identity. Descriptors naming the same lobby owner or the same
/// server address share one pending probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PeerKey {
    Peer(PeerId),
    Server(SocketAddr),
}

impl PeerKey {
    /// `None` for dedicated hosts that are not literal addresses yet.
    fn for_descriptor(target: &JoinDescriptor) -> Option<Self> {
        match target {
            JoinDescriptor::PeerUser { peer_id } => Some(PeerKey::Peer(*peer_id)),
            JoinDescriptor::Dedicated { .. } => target.literal_addr().map(PeerKey::Server),
            JoinDescriptor::EntitySessionUser { .. } => {
                panic!("peer-lobby backend cannot serve entity-session descriptor {target}")
            }
        }
    }
}

struct ListSearch {
    request: RequestId,
    elapsed: Duration,
}

pub struct PeerLobbyBackend {
    service: Box<dyn PeerLobbyService>,
    config: MatchmakingConfig,
    clock: SharedClock,
    flags: RefreshFlags,
    filter: String,
    search: Option<ListSearch>,
    since_refresh: Option<Duration>,
    /// Last unfiltered result set
    results: Vec<CachedServerEntry>,
    public_list: Vec<CachedServerEntry>,
    revision: u64,
    pings: PendingPings<PeerKey>,
    probes: HashMap<RequestId, PeerKey>,
    cache: HashMap<PeerKey, SessionDescriptor>,
}

impl PeerLobbyBackend {
    pub fn new(service: Box<dyn PeerLobbyService>, config: MatchmakingConfig, clock: SharedClock) -> Self {
        let pings = PendingPings::new(config.ping_timeout(), config.refresh_interval());
        Self {
            service,
            config,
            clock,
            flags: RefreshFlags::default(),
            filter: String::new(),
            search: None,
            since_refresh: None,
            results: Vec::new(),
            public_list: Vec::new(),
            revision: 0,
            pings,
            probes: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    fn apply_filter(&mut self) {
        let filter = self.filter.clone();
        let network_version = self.config.network_version;
        let compatible_only = self.flags.compatible_only;

        self.public_list = self
            .results
            .iter()
            .filter(|entry| {
                let Some(info) = entry.data.info.as_ref() else {
                    return false;
                };
                (filter.is_empty() || info.name.to_lowercase().contains(&filter))
                    && (!compatible_only || info.is_compatible(network_version))
            })
            .cloned()
            .collect();
        self.revision += 1;
    }

    fn store(&mut self, key: PeerKey, snapshot: SessionDescriptor) {
        if should_replace(self.cache.get(&key), &snapshot) {
            if let Some(addr) = snapshot.info.as_ref().and_then(|i| i.endpoint) {
                if key != PeerKey::Server(addr) && should_replace(self.cache.get(&PeerKey::Server(addr)), &snapshot) {
                    self.cache.insert(PeerKey::Server(addr), snapshot.clone());
                }
            }
            self.cache.insert(key, snapshot);
        }
    }

    fn on_lobby_list(&mut self, request: RequestId, result: Result<Vec<LobbyRecord>, ServiceError>) {
        match &self.search {
            Some(search) if search.request == request => {}
            _ => {
                debug!(request, "Ignoring lobby list for a superseded search");
                return;
            }
        }
        self.search = None;

        match result {
            Ok(records) => {
                let now = self.clock.now();
                self.results = records
                    .iter()
                    .map(|record| {
                        CachedServerEntry::new(
                            JoinDescriptor::PeerUser { peer_id: record.owner },
                            SessionDescriptor::new(record_to_info(record), now),
                        )
                    })
                    .collect();
                for entry in self.results.clone() {
                    if let JoinDescriptor::PeerUser { peer_id } = entry.descriptor {
                        self.store(PeerKey::Peer(peer_id), entry.data);
                    }
                }
                self.apply_filter();
                info!(
                    "🔎 Peer-lobby search complete: {} lobbies, {} listed",
                    self.results.len(),
                    self.public_list.len()
                );
            }
            Err(e) => warn!("Peer-lobby search failed: {}", e),
        }
    }

    fn on_probe(&mut self, request: RequestId, result: Result<LobbyRecord, ServiceError>) {
        let Some(key) = self.probes.remove(&request) else {
            debug!(request, "Ignoring probe result for an expired ping");
            return;
        };

        let now = self.clock.now();
        let snapshot = match result {
            Ok(record) => SessionDescriptor::new(record_to_info(&record), now),
            Err(e) => {
                debug!(?key, "Probe failed: {}", e);
                SessionDescriptor::none(now)
            }
        };
        self.store(key, snapshot.clone());

        for waiter in self.pings.complete(&key) {
            waiter(&snapshot);
        }
    }
}

impl MatchmakingBackend for PeerLobbyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PeerUser
    }

    fn refresh_public_list(&mut self, flags: RefreshFlags) -> MatchmakingResult<()> {
        if !self.service.is_logged_in() {
            return Err(MatchmakingError::BackendUnavailable(
                "peer-lobby provider is not logged in".to_string(),
            ));
        }
        if self
            .since_refresh
            .is_some_and(|since| since < self.config.refresh_interval())
        {
            return Err(MatchmakingError::RateLimited);
        }

        self.cancel_refresh();
        self.flags = flags;
        let request = self.service.request_lobby_list(flags.friends_only);
        self.search = Some(ListSearch {
            request,
            elapsed: Duration::ZERO,
        });
        self.since_refresh = Some(Duration::ZERO);
        debug!(request, friends_only = flags.friends_only, "Peer-lobby search started");
        Ok(())
    }

    fn cancel_refresh(&mut self) {
        if let Some(search) = self.search.take() {
            self.service.cancel_request(search.request);
            debug!(request = search.request, "Peer-lobby search cancelled");
        }
    }

    fn set_filter(&mut self, filter: &str) {
        let filter = filter.trim().to_lowercase();
        if filter != self.filter {
            self.filter = filter;
            self.apply_filter();
        }
    }

    fn can_refresh_now(&self) -> bool {
        self.service.is_logged_in()
            && self.search.is_none()
            && self
                .since_refresh
                .map_or(true, |since| since >= self.config.refresh_interval())
    }

    fn public_list(&self) -> &[CachedServerEntry] {
        &self.public_list
    }

    fn list_revision_changed(&self, last_seen: &mut u64) -> bool {
        let changed = *last_seen != self.revision;
        *last_seen = self.revision;
        changed
    }

    fn ping(&mut self, target: &JoinDescriptor, callback: PingCallback) -> PingStatus {
        let Some(key) = PeerKey::for_descriptor(target) else {
            return PingStatus::Rejected(MatchmakingError::BackendUnavailable(format!(
                "{target} has not been resolved to an address"
            )));
        };

        let callback = match self.pings.attach(&key, callback) {
            Ok(()) => {
                debug!(%target, "Ping coalesced with pending probe");
                return PingStatus::Coalesced;
            }
            Err(callback) => callback,
        };
        if !self.service.is_logged_in() {
            return PingStatus::Rejected(MatchmakingError::BackendUnavailable(
                "peer-lobby provider is not logged in".to_string(),
            ));
        }
        if self.pings.is_rate_limited(&key) || self.pings.len() >= self.config.max_pending_pings {
            debug!(%target, "Ping rate limited");
            return PingStatus::Rejected(MatchmakingError::RateLimited);
        }

        let request = match key {
            PeerKey::Peer(peer) => self.service.request_lobby_data(peer),
            PeerKey::Server(addr) => self.service.query_server(addr),
        };
        self.probes.insert(request, key);
        self.pings.begin(key, callback);
        PingStatus::Dispatched
    }

    fn cached_data(&self, target: &JoinDescriptor, newer_than: DateTime<Utc>) -> Option<SessionDescriptor> {
        let key = PeerKey::for_descriptor(target)?;
        self.cache
            .get(&key)
            .filter(|snapshot| snapshot.is_newer_than(newer_than))
            .cloned()
    }

    fn cache_data(&mut self, target: &JoinDescriptor, data: SessionDescriptor) {
        if let Some(key) = PeerKey::for_descriptor(target) {
            self.store(key, data);
        }
    }

    fn resolve_join_target(&self, target: &JoinDescriptor) -> Option<ConnectTarget> {
        match PeerKey::for_descriptor(target)? {
            PeerKey::Server(addr) => Some(ConnectTarget::Address(addr)),
            key @ PeerKey::Peer(peer) => connect_target_from(self.cache.get(&key), ConnectTarget::Peer(peer)),
        }
    }

    fn tick(&mut self, dt: Duration) {
        if let Some(since) = self.since_refresh.as_mut() {
            *since += dt;
        }

        let timed_out = match self.search.as_mut() {
            Some(search) => {
                search.elapsed += dt;
                search.elapsed >= self.config.search_timeout()
            }
            None => false,
        };
        if timed_out {
            warn!("Peer-lobby search timed out");
            self.cancel_refresh();
        }

        for event in self.service.poll_events() {
            match event {
                PeerLobbyEvent::LobbyList { request, result } => self.on_lobby_list(request, result),
                PeerLobbyEvent::Probe { request, result } => self.on_probe(request, result),
            }
        }

        let expired = self.pings.advance(dt);
        if !expired.is_empty() {
            let now = self.clock.now();
            for (key, waiters) in expired {
                let stale: Vec<RequestId> = self
                    .probes
                    .iter()
                    .filter(|(_, k)| **k == key)
                    .map(|(request, _)| *request)
                    .collect();
                for request in stale {
                    self.probes.remove(&request);
                    self.service.cancel_request(request);
                }
                debug!(?key, "Ping timed out");
                let unknown = SessionDescriptor::none(now);
                for waiter in waiters {
                    waiter(&unknown);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{LobbyDirectory, LobbyRequest};
    use std::sync::{Arc, Mutex};

    fn backend(directory: &LobbyDirectory) -> (PeerLobbyBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = PeerLobbyBackend::new(
            Box::new(directory.connect()),
            MatchmakingConfig::default(),
            clock.clone(),
        );
        (backend, clock)
    }

    fn lobby(owner: u64, name: &str, tags: &str) -> LobbyRecord {
        LobbyRecord {
            tags: tags.to_string(),
            player_count: 2,
            max_players: 10,
            ..LobbyRecord::new(PeerId(owner), name)
        }
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_version_tags("0.217.46|nv=27|mods=hardcore,nomap");
        assert_eq!(tags.game_version, "0.217.46");
        assert_eq!(tags.network_version, 27);
        assert_eq!(tags.modifiers, vec!["hardcore", "nomap"]);

        let round = format_version_tags("0.217.46", 27, &tags.modifiers);
        assert_eq!(parse_version_tags(&round), tags);
    }

    #[test]
    fn test_unparseable_tag_falls_back_to_version() {
        for raw in ["0.216.9", "0.217|nv=abc", "0.217|nv=3|weird"] {
            let tags = parse_version_tags(raw);
            assert_eq!(tags.game_version, raw);
            assert_eq!(tags.network_version, 0);
            assert!(tags.modifiers.is_empty());
        }
    }

    #[test]
    fn test_refresh_replaces_list_and_bumps_revision() {
        let directory = LobbyDirectory::new();
        directory.publish(lobby(1, "Alpha", "1.0|nv=1"));
        directory.publish(lobby(2, "Beta", "garbage"));
        let (mut backend, _) = backend(&directory);

        let mut seen = 0;
        backend.refresh_public_list(RefreshFlags::default()).unwrap();
        assert!(!backend.list_revision_changed(&mut seen));

        backend.tick(Duration::from_millis(100));
        assert!(backend.list_revision_changed(&mut seen));
        assert!(!backend.list_revision_changed(&mut seen));
        assert_eq!(backend.public_list().len(), 2);

        let incompatible = backend
            .public_list()
            .iter()
            .find(|e| e.name() == Some("Beta"))
            .unwrap();
        assert_eq!(incompatible.data.info.as_ref().unwrap().network_version, 0);
    }

    #[test]
    fn test_refresh_is_rate_limited() {
        let directory = LobbyDirectory::new();
        let (mut backend, _) = backend(&directory);

        backend.refresh_public_list(RefreshFlags::default()).unwrap();
        backend.tick(Duration::from_millis(500));
        assert_eq!(
            backend.refresh_public_list(RefreshFlags::default()),
            Err(MatchmakingError::RateLimited)
        );
        assert!(!backend.can_refresh_now());

        backend.tick(Duration::from_millis(1500));
        assert!(backend.can_refresh_now());
        assert!(backend.refresh_public_list(RefreshFlags::default()).is_ok());
    }

    #[test]
    fn test_new_refresh_cancels_stale_search() {
        let directory = LobbyDirectory::new();
        directory.set_responsive(false);
        let (mut backend, _) = backend(&directory);

        backend.refresh_public_list(RefreshFlags::default()).unwrap();
        backend.tick(Duration::from_secs(2));
        backend.refresh_public_list(RefreshFlags::default()).unwrap();

        let requests = directory.requests();
        assert!(requests.iter().any(|r| matches!(r, LobbyRequest::Cancel(_))));
        assert_eq!(
            requests
                .iter()
                .filter(|r| matches!(r, LobbyRequest::LobbyList { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_filter_is_client_side() {
        let directory = LobbyDirectory::new();
        directory.publish(lobby(1, "Viking Valhalla", "1.0|nv=1"));
        directory.publish(lobby(2, "Cozy Farm", "1.0|nv=1"));
        let (mut backend, _) = backend(&directory);
        backend.refresh_public_list(RefreshFlags::default()).unwrap();
        backend.tick(Duration::from_millis(10));

        let before = directory.requests().len();
        backend.set_filter("VIKING");
        assert_eq!(backend.public_list().len(), 1);
        assert_eq!(directory.requests().len(), before);
    }

    #[test]
    fn test_unanswered_ping_resolves_as_none() {
        let directory = LobbyDirectory::new();
        directory.set_responsive(false);
        let (mut backend, _) = backend(&directory);

        let result = Arc::new(Mutex::new(None));
        let sink = result.clone();
        let status = backend.ping(
            &JoinDescriptor::peer(9),
            Box::new(move |d: &SessionDescriptor| {
                *sink.lock().unwrap() = Some(d.clone());
            }),
        );
        assert!(status.dispatched());

        backend.tick(Duration::from_secs(5));
        let delivered = result.lock().unwrap().clone().unwrap();
        assert!(delivered.is_none());
        assert_eq!(backend.pending_pings(), 0);
    }

    #[test]
    #[should_panic(expected = "cannot serve entity-session descriptor")]
    fn test_wrong_variant_fails_fast() {
        let directory = LobbyDirectory::new();
        let (mut backend, _) = backend(&directory);
        backend.ping(&JoinDescriptor::entity("E1"), Box::new(|_: &SessionDescriptor| {}));
    }
}
