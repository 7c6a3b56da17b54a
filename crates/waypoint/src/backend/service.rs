//! Interface boundary of the two external session providers.
//!
//! Providers are asynchronous from the backend's point of view: every
//! request returns a [`RequestId`] immediately and its outcome arrives later
//! as an event from `poll_events`, which backends drain once per tick.

use crate::error::ServiceError;
use crate::types::{EntityId, PeerId, PlatformRestriction, PlatformUserId, ServerInfo};
use std::net::SocketAddr;

pub type RequestId = u64;

// ============================================================================
// Peer-lobby provider
// ============================================================================

/// A lobby as advertised by its hosting peer.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyRecord {
    pub owner: PeerId,
    pub name: String,
    /// Free-form version tag, normally `version|nv=N|mods=a,b`
    pub tags: String,
    pub player_count: u32,
    pub max_players: u32,
    pub password_protected: bool,
    pub platform_restriction: PlatformRestriction,
    /// Game-server address, for lobbies fronting a listening server
    pub server_addr: Option<SocketAddr>,
    pub host_id: Option<PlatformUserId>,
}

impl LobbyRecord {
    pub fn new(owner: PeerId, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
            tags: String::new(),
            player_count: 0,
            max_players: 0,
            password_protected: false,
            platform_restriction: PlatformRestriction::Any,
            server_addr: None,
            host_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerLobbyEvent {
    LobbyList {
        request: RequestId,
        result: Result<Vec<LobbyRecord>, ServiceError>,
    },
    /// Answer to a single lobby-data or server query
    Probe {
        request: RequestId,
        result: Result<LobbyRecord, ServiceError>,
    },
}

pub trait PeerLobbyService: Send {
    fn is_logged_in(&self) -> bool;

    fn request_lobby_list(&mut self, friends_only: bool) -> RequestId;

    /// Fetches the lobby owned by `owner`.
    fn request_lobby_data(&mut self, owner: PeerId) -> RequestId;

    /// Queries a game server directly by address.
    fn query_server(&mut self, addr: SocketAddr) -> RequestId;

    /// Cancelled requests never produce an event.
    fn cancel_request(&mut self, request: RequestId);

    fn poll_events(&mut self) -> Vec<PeerLobbyEvent>;
}

// ============================================================================
// Entity-session provider
// ============================================================================

pub type NetworkId = String;
pub type LobbyId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// Public browse; `network_version` 0 matches any version
    Public {
        name_contains: Option<String>,
        network_version: u32,
    },
    JoinCode(String),
    Owner(EntityId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub filter: SearchFilter,
    /// Opaque token returned with the previous page
    pub continuation: Option<String>,
}

impl SearchQuery {
    pub fn new(filter: SearchFilter) -> Self {
        Self {
            filter,
            continuation: None,
        }
    }
}

/// A registered session as returned by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub lobby_id: LobbyId,
    pub owner: EntityId,
    pub info: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub records: Vec<SessionRecord>,
    pub continuation: Option<String>,
}

/// Reason attached to a network-session loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    NetworkTimeout,
    /// Transport was reset underneath a healthy session
    TransportReset,
    ServiceShutdown,
    Other(i32),
}

impl DisconnectReason {
    /// Losses that are known to recover quickly use the short reconnect delay.
    pub fn allows_fast_recovery(&self) -> bool {
        matches!(self, DisconnectReason::TransportReset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntitySessionEvent {
    SearchCompleted {
        request: RequestId,
        result: Result<SearchPage, ServiceError>,
    },
    NetworkCreated {
        request: RequestId,
        result: Result<NetworkId, ServiceError>,
    },
    LobbyCreated {
        request: RequestId,
        result: Result<LobbyId, ServiceError>,
    },
    LobbyUpdated {
        request: RequestId,
        result: Result<(), ServiceError>,
    },
    NetworkDisconnected {
        network: NetworkId,
        reason: DisconnectReason,
    },
}

pub trait EntitySessionService: Send {
    /// The authenticated local entity, `None` while logged out.
    fn local_entity(&self) -> Option<EntityId>;

    fn submit_search(&mut self, query: &SearchQuery) -> RequestId;

    fn cancel_request(&mut self, request: RequestId);

    fn create_network(&mut self) -> RequestId;

    fn leave_network(&mut self, network: &NetworkId);

    fn create_lobby(&mut self, network: &NetworkId, info: &ServerInfo) -> RequestId;

    fn update_lobby(&mut self, lobby: &LobbyId, info: &ServerInfo) -> RequestId;

    fn leave_lobby(&mut self, lobby: &LobbyId);

    fn poll_events(&mut self) -> Vec<EntitySessionEvent>;
}
