//! # Matchmaking backends
//!
//! One contract, two providers:
//!
//! - [`peer_lobby::PeerLobbyBackend`] - servers advertise lobbies owned by a
//!   hosting peer; discovery pulls the whole list and filters client-side.
//!   Also answers direct queries against dedicated server addresses.
//! - [`entity_session::EntitySessionBackend`] - servers register sessions
//!   under an authenticated entity with a join code; discovery is a paged,
//!   server-side filtered search through a rate-limited submission queue.
//!
//! Both are driven by `tick(dt)` and never block. Transient conditions
//! (rate limiting, searches in flight) surface as "no data yet".

pub mod entity_session;
pub mod peer_lobby;
pub(crate) mod pending;
pub mod service;

use crate::error::{MatchmakingError, MatchmakingResult};
use crate::types::{BackendKind, CachedServerEntry, EntityId, JoinDescriptor, PeerId, SessionDescriptor};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Duration;

pub use entity_session::EntitySessionBackend;
pub use peer_lobby::PeerLobbyBackend;

/// Invoked exactly once with the probe result, which may be the "none" snapshot.
pub type PingCallback = Box<dyn FnOnce(&SessionDescriptor) + Send>;

/// Synchronous outcome of [`MatchmakingBackend::ping`].
#[derive(Debug, Clone, PartialEq)]
pub enum PingStatus {
    /// A new probe was sent.
    Dispatched,
    /// A probe for the same target was already pending; the callback will
    /// receive that probe's result.
    Coalesced,
    /// Nothing was scheduled and the callback was dropped.
    Rejected(MatchmakingError),
}

impl PingStatus {
    /// True only when this call started new network work.
    pub fn dispatched(&self) -> bool {
        matches!(self, PingStatus::Dispatched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshFlags {
    /// Restrict the browse to sessions hosted by friends
    pub friends_only: bool,
    /// Drop sessions whose network version differs from ours (unknown
    /// versions included) instead of listing them as incompatible
    pub compatible_only: bool,
}

/// Where a join descriptor finally connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectTarget {
    Address(SocketAddr),
    /// Relay through the peer-lobby provider by host identity
    Peer(PeerId),
    /// Relay through the entity-session provider by owner identity
    Entity(EntityId),
}

pub trait MatchmakingBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Starts a public list search, cancelling any search still in flight.
    fn refresh_public_list(&mut self, flags: RefreshFlags) -> MatchmakingResult<()>;

    fn cancel_refresh(&mut self);

    fn set_filter(&mut self, filter: &str);

    /// Rate window elapsed and no search in flight.
    fn can_refresh_now(&self) -> bool;

    fn public_list(&self) -> &[CachedServerEntry];

    /// Compares `last_seen` against the list revision, updating it.
    fn list_revision_changed(&self, last_seen: &mut u64) -> bool;

    fn ping(&mut self, target: &JoinDescriptor, callback: PingCallback) -> PingStatus;

    /// Latest snapshot for `target` captured strictly after `newer_than`.
    fn cached_data(&self, target: &JoinDescriptor, newer_than: DateTime<Utc>) -> Option<SessionDescriptor>;

    fn cache_data(&mut self, target: &JoinDescriptor, data: SessionDescriptor);

    fn resolve_join_target(&self, target: &JoinDescriptor) -> Option<ConnectTarget>;

    fn tick(&mut self, dt: Duration);
}

/// Newest-wins replacement shared by backend and dispatcher caches.
pub(crate) fn should_replace(existing: Option<&SessionDescriptor>, incoming: &SessionDescriptor) -> bool {
    match existing {
        Some(old) => incoming.captured_at >= old.captured_at,
        None => true,
    }
}

/// Resolves a join target from a cached snapshot, preferring a direct address.
pub(crate) fn connect_target_from(
    snapshot: Option<&SessionDescriptor>,
    fallback: ConnectTarget,
) -> Option<ConnectTarget> {
    let info = snapshot?.info.as_ref()?;
    Some(match info.endpoint {
        Some(addr) => ConnectTarget::Address(addr),
        None => fallback,
    })
}
