//! Integration tests for discovery through the dispatcher
//!
//! These drive the dispatcher against the in-memory providers and check
//! the behaviour callers depend on: probe coalescing, cache freshness,
//! join-by-code and the dedicated hostname flow from typed address to
//! connect target.

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use waypoint::backend::service::LobbyRecord;
use waypoint::backend::{ConnectTarget, EntitySessionBackend, PeerLobbyBackend};
use waypoint::clock::{Clock, ManualClock};
use waypoint::dns::DnsCache;
use waypoint::memory::{LobbyDirectory, LobbyRequest, SessionDirectory, StaticResolver};
use waypoint::{
    BackendKind, CachedServerEntry, EntityId, JoinDescriptor, MatchmakingConfig, MatchmakingDispatcher,
    MatchmakingError, PeerId, PingCallback, PingStatus, RefreshFlags, ServerInfo, SessionDescriptor,
};

const TICK: Duration = Duration::from_millis(50);

struct World {
    dispatcher: MatchmakingDispatcher,
    clock: Arc<ManualClock>,
    lobbies: LobbyDirectory,
    sessions: SessionDirectory,
    resolver: StaticResolver,
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = MatchmakingConfig::default();
    let lobbies = LobbyDirectory::new();
    let sessions = SessionDirectory::new();
    let resolver = StaticResolver::new().with_host("play.example.com", "203.0.113.9".parse().unwrap());
    let dispatcher = MatchmakingDispatcher::new(
        PeerLobbyBackend::new(Box::new(lobbies.connect()), config.clone(), clock.clone()),
        EntitySessionBackend::new(Box::new(sessions.connect("LOCAL")), config, clock.clone()),
        DnsCache::new(Box::new(resolver.clone())),
        clock.clone(),
    );
    World {
        dispatcher,
        clock,
        lobbies,
        sessions,
        resolver,
    }
}

fn recorder() -> (Arc<Mutex<Vec<SessionDescriptor>>>, impl Fn() -> PingCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let make = move || -> PingCallback {
        let sink = sink.clone();
        Box::new(move |snapshot: &SessionDescriptor| sink.lock().unwrap().push(snapshot.clone()))
    };
    (seen, make)
}

fn lobby_data_requests(lobbies: &LobbyDirectory) -> usize {
    lobbies
        .requests()
        .iter()
        .filter(|r| matches!(r, LobbyRequest::LobbyData(_)))
        .count()
}

#[test]
fn test_concurrent_pings_share_one_probe() {
    let mut world = world();
    world.lobbies.publish(LobbyRecord {
        tags: "1.0|nv=1".to_string(),
        player_count: 2,
        ..LobbyRecord::new(PeerId(42), "Shared")
    });
    let target = JoinDescriptor::peer(42);
    let (seen, callback) = recorder();

    assert_eq!(world.dispatcher.ping(&target, callback()), PingStatus::Dispatched);
    assert_eq!(world.dispatcher.ping(&target, callback()), PingStatus::Coalesced);
    assert_eq!(world.dispatcher.ping(&target, callback()), PingStatus::Coalesced);
    world.dispatcher.tick(TICK);

    assert_eq!(lobby_data_requests(&world.lobbies), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s == &seen[0]));
    assert_eq!(seen[0].info.as_ref().unwrap().name, "Shared");
}

#[test]
fn test_repeat_ping_waits_for_rate_window() {
    let mut world = world();
    world.lobbies.publish(LobbyRecord::new(PeerId(7), "Busy"));
    let target = JoinDescriptor::peer(7);
    let (seen, callback) = recorder();

    assert!(world.dispatcher.ping(&target, callback()).dispatched());
    world.dispatcher.tick(TICK);
    assert_eq!(
        world.dispatcher.ping(&target, callback()),
        PingStatus::Rejected(MatchmakingError::RateLimited)
    );

    world.dispatcher.tick(Duration::from_secs(3));
    assert!(world.dispatcher.ping(&target, callback()).dispatched());
    world.dispatcher.tick(TICK);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(lobby_data_requests(&world.lobbies), 2);
}

#[test]
fn test_cache_freshness_is_strict() {
    let mut world = world();
    let target = JoinDescriptor::peer(3);
    let t = world.clock.now();
    let info = ServerInfo {
        name: "Cached".to_string(),
        ..Default::default()
    };

    world
        .dispatcher
        .cache_data(&target, SessionDescriptor::new(info.clone(), t));
    assert!(world.dispatcher.cached_data(&target, t).is_none());
    let just_before = t - chrono::Duration::milliseconds(1);
    assert_eq!(
        world.dispatcher.cached_data(&target, just_before).unwrap().info,
        Some(info)
    );

    // An older snapshot never replaces a newer one.
    let stale = SessionDescriptor::none(t - chrono::Duration::seconds(10));
    world.dispatcher.cache_data(&target, stale);
    assert!(!world.dispatcher.cached_data(&target, just_before).unwrap().is_none());
}

#[test]
fn test_join_code_resolves_to_entity_session() {
    let mut world = world();
    world.sessions.register(
        EntityId::new("HOST"),
        ServerInfo {
            name: "Coded".to_string(),
            network_version: 1,
            join_code: Some("482913".to_string()),
            ..Default::default()
        },
    );

    let found: Arc<Mutex<Option<Option<CachedServerEntry>>>> = Arc::new(Mutex::new(None));
    let sink = found.clone();
    world
        .dispatcher
        .entity_session_mut()
        .find_by_join_code(" 482913 ", Box::new(move |entry| *sink.lock().unwrap() = Some(entry)))
        .unwrap();
    for _ in 0..3 {
        world.dispatcher.tick(Duration::from_secs(1));
    }

    let entry = found.lock().unwrap().clone().unwrap().unwrap();
    assert_eq!(entry.descriptor, JoinDescriptor::entity("HOST"));
    assert_eq!(entry.name(), Some("Coded"));
    assert_eq!(
        world.dispatcher.resolve_join_target(&entry.descriptor),
        Some(ConnectTarget::Entity(EntityId::new("HOST")))
    );
}

#[test]
fn test_unknown_join_code_reports_none() {
    let mut world = world();
    let found = Arc::new(Mutex::new(None));
    let sink = found.clone();
    world
        .dispatcher
        .entity_session_mut()
        .find_by_join_code("000000", Box::new(move |entry| *sink.lock().unwrap() = Some(entry)))
        .unwrap();
    for _ in 0..3 {
        world.dispatcher.tick(Duration::from_secs(1));
    }
    assert_eq!(*found.lock().unwrap(), Some(None));
}

#[test]
fn test_both_public_lists_refresh() {
    let mut world = world();
    let mut events = world.dispatcher.subscribe();
    world.lobbies.publish(LobbyRecord {
        tags: "1.0|nv=1".to_string(),
        ..LobbyRecord::new(PeerId(1), "Lobby One")
    });
    world.sessions.register(
        EntityId::new("E1"),
        ServerInfo {
            name: "Session One".to_string(),
            network_version: 1,
            ..Default::default()
        },
    );

    for kind in [BackendKind::PeerUser, BackendKind::EntitySessionUser] {
        world.dispatcher.refresh(kind, RefreshFlags::default()).unwrap();
    }
    for _ in 0..3 {
        world.dispatcher.tick(Duration::from_secs(1));
    }

    assert_eq!(world.dispatcher.public_list(BackendKind::PeerUser)[0].name(), Some("Lobby One"));
    assert_eq!(
        world.dispatcher.public_list(BackendKind::EntitySessionUser)[0].name(),
        Some("Session One")
    );

    let mut updated = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let waypoint::MatchmakingEvent::ListUpdated(kind) = event {
            updated.push(kind);
        }
    }
    assert!(updated.contains(&BackendKind::PeerUser));
    assert!(updated.contains(&BackendKind::EntitySessionUser));
}

/// A user types `play.example.com:2456`; the host resolves to 203.0.113.9
/// where a dedicated server answers.
#[test]
fn test_dedicated_hostname_end_to_end() {
    let mut world = world();
    let server_addr: SocketAddr = "203.0.113.9:2456".parse().unwrap();
    world.lobbies.register_server(
        server_addr,
        LobbyRecord {
            tags: "1.0|nv=1".to_string(),
            player_count: 4,
            max_players: 10,
            server_addr: Some(server_addr),
            ..LobbyRecord::new(PeerId(900), "Play Example")
        },
    );

    let target: JoinDescriptor = "play.example.com:2456".parse().unwrap();
    assert_eq!(target, JoinDescriptor::dedicated("play.example.com", 2456));
    assert_eq!(world.dispatcher.resolve_join_target(&target), None);

    let before = world.clock.now() - chrono::Duration::seconds(1);
    let (seen, callback) = recorder();
    world.dispatcher.ping(&target, callback());
    let address = Arc::new(Mutex::new(None));
    let sink = address.clone();
    world
        .dispatcher
        .get_server_ip_async(&target, Box::new(move |addr| *sink.lock().unwrap() = Some(addr)));

    for _ in 0..3 {
        world.dispatcher.tick(TICK);
    }

    // One lookup served both requests.
    assert_eq!(world.resolver.lookups(), vec!["play.example.com".to_string()]);
    assert_eq!(*address.lock().unwrap(), Some(Some(server_addr)));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let info = seen[0].info.as_ref().unwrap();
    assert_eq!(info.name, "Play Example");
    assert_eq!(info.player_count, 4);

    assert_eq!(
        world.dispatcher.resolve_join_target(&target),
        Some(ConnectTarget::Address(server_addr))
    );
    assert!(world.dispatcher.cached_data(&target, before).is_some());
}
