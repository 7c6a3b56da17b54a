//! # Core Type Definitions
//!
//! Value types shared by every part of the matchmaking layer.
//!
//! ## Key Types
//!
//! - [`JoinDescriptor`] - *how* to reach a server (peer identity, entity identity or address)
//! - [`SessionDescriptor`] - *what is known* about a server at a point in time
//! - [`ServerInfo`] - the typed payload of a session snapshot
//! - [`ServerListEntry`] - a persisted list row (descriptor + cached display name)
//! - [`PlatformUserId`] - platform-qualified user identity used by access lists
//!
//! ## Design Principles
//!
//! - **Immutability**: descriptors are plain values, usable as map keys
//! - **Atomic replacement**: session snapshots are replaced whole, never patched
//! - **Explicit "none"**: an unreachable server is a snapshot without info, not an error

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

// ============================================================================
// Identities
// ============================================================================

/// Native identity of a hosting peer on the peer-lobby backend.
///
/// Zero is never a valid peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity identity of a session owner on the entity-session backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform a user or host is signed in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Platform {
    #[default]
    Unknown,
    Steam,
    Xbox,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Unknown => "None",
            Platform::Steam => "Steam",
            Platform::Xbox => "Xbox",
        }
    }
}

impl FromStr for Platform {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Steam" => Ok(Platform::Steam),
            "Xbox" => Ok(Platform::Xbox),
            "None" | "" => Ok(Platform::Unknown),
            _ => Err(()),
        }
    }
}

/// Platform-qualified user identity.
///
/// The stable string form is `Platform_userid` (e.g. `Steam_76561198000000001`).
/// Lists written by older builds stored the bare user id instead; both forms
/// are accepted wherever identities are compared against persisted lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformUserId {
    pub platform: Platform,
    pub user_id: String,
}

impl PlatformUserId {
    pub fn new(platform: Platform, user_id: impl Into<String>) -> Self {
        Self {
            platform,
            user_id: user_id.into(),
        }
    }

    /// The legacy bare-id representation.
    pub fn raw_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_valid(&self) -> bool {
        self.platform != Platform::Unknown && !self.user_id.is_empty()
    }
}

impl fmt::Display for PlatformUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.platform.as_str(), self.user_id)
    }
}

impl FromStr for PlatformUserId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, id) = s
            .split_once('_')
            .ok_or_else(|| format!("missing platform prefix in '{s}'"))?;
        let platform = platform
            .parse::<Platform>()
            .map_err(|_| format!("unknown platform '{platform}'"))?;
        if id.is_empty() {
            return Err(format!("empty user id in '{s}'"));
        }
        Ok(Self::new(platform, id))
    }
}

/// Which platforms a session admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlatformRestriction {
    /// Crossplay session, any platform may join.
    #[default]
    Any,
    /// Only users of the given platform may join.
    Only(Platform),
}

impl PlatformRestriction {
    pub fn admits(&self, platform: Platform) -> bool {
        match self {
            PlatformRestriction::Any => true,
            PlatformRestriction::Only(only) => *only == platform,
        }
    }
}

/// Reference position sent with peer info.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

// ============================================================================
// Join descriptors
// ============================================================================

/// Discriminant of a [`JoinDescriptor`], also used as the persisted backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    PeerUser,
    EntitySessionUser,
    Dedicated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::PeerUser => "PeerUser",
            BackendKind::EntitySessionUser => "EntitySessionUser",
            BackendKind::Dedicated => "Dedicated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PeerUser" => Ok(BackendKind::PeerUser),
            "EntitySessionUser" => Ok(BackendKind::EntitySessionUser),
            "Dedicated" => Ok(BackendKind::Dedicated),
            other => Err(format!("unknown backend kind '{other}'")),
        }
    }
}

/// Identifies a join target.
///
/// Equality and hashing are structural per variant, so descriptors of
/// different variants never compare equal even when their payloads print
/// the same.
///
/// # Examples
///
/// ```rust
/// use waypoint::types::JoinDescriptor;
///
/// let a = JoinDescriptor::dedicated("play.example.com", 2456);
/// let b: JoinDescriptor = "play.example.com:2456".parse().unwrap();
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinDescriptor {
    PeerUser { peer_id: PeerId },
    EntitySessionUser { remote_entity_id: EntityId },
    Dedicated { host: String, port: u16 },
}

impl JoinDescriptor {
    pub fn peer(peer_id: u64) -> Self {
        JoinDescriptor::PeerUser {
            peer_id: PeerId(peer_id),
        }
    }

    pub fn entity(remote_entity_id: impl Into<String>) -> Self {
        JoinDescriptor::EntitySessionUser {
            remote_entity_id: EntityId::new(remote_entity_id),
        }
    }

    pub fn dedicated(host: impl Into<String>, port: u16) -> Self {
        JoinDescriptor::Dedicated {
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        JoinDescriptor::Dedicated {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            JoinDescriptor::PeerUser { .. } => BackendKind::PeerUser,
            JoinDescriptor::EntitySessionUser { .. } => BackendKind::EntitySessionUser,
            JoinDescriptor::Dedicated { .. } => BackendKind::Dedicated,
        }
    }

    /// A descriptor is valid when the fields its variant needs are populated.
    pub fn is_valid(&self) -> bool {
        match self {
            JoinDescriptor::PeerUser { peer_id } => peer_id.is_valid(),
            JoinDescriptor::EntitySessionUser { remote_entity_id } => remote_entity_id.is_valid(),
            JoinDescriptor::Dedicated { host, port } => !host.trim().is_empty() && *port != 0,
        }
    }

    /// The literal socket address of a dedicated descriptor, if its host is
    /// already an IP address. Hostnames need the DNS cache.
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        match self {
            JoinDescriptor::Dedicated { host, port } => host
                .parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, *port)),
            _ => None,
        }
    }
}

impl fmt::Display for JoinDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinDescriptor::PeerUser { peer_id } => write!(f, "peer:{peer_id}"),
            JoinDescriptor::EntitySessionUser { remote_entity_id } => {
                write!(f, "entity:{remote_entity_id}")
            }
            JoinDescriptor::Dedicated { host, port } => match host.parse::<IpAddr>() {
                Ok(IpAddr::V6(ip)) => write!(f, "[{ip}]:{port}"),
                _ => write!(f, "{host}:{port}"),
            },
        }
    }
}

/// Parses a user-typed `host:port` (or `[v6]:port`) address into a dedicated descriptor.
impl FromStr for JoinDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(JoinDescriptor::from_socket_addr(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{s}': {e}"))?;
        let descriptor = JoinDescriptor::dedicated(host, port);
        if !descriptor.is_valid() {
            return Err(format!("invalid address '{s}'"));
        }
        Ok(descriptor)
    }
}

// ============================================================================
// Session snapshots
// ============================================================================

/// Everything known about a live server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerInfo {
    /// Display name
    pub name: String,
    pub player_count: u32,
    pub max_players: u32,
    /// Platform identity of the hosting user
    pub host_id: Option<PlatformUserId>,
    /// Native peer identity of the host, when the peer-lobby backend knows it
    pub host_peer: Option<PeerId>,
    pub game_version: String,
    /// Network protocol version; 0 means unknown and is never compatible
    pub network_version: u32,
    /// Entity-session backend only
    pub join_code: Option<String>,
    pub password_protected: bool,
    pub platform_restriction: PlatformRestriction,
    /// Active world modifiers
    pub modifiers: Vec<String>,
    /// Game-server endpoint advertised by the host, when there is one
    pub endpoint: Option<SocketAddr>,
}

impl ServerInfo {
    pub fn is_full(&self) -> bool {
        self.max_players > 0 && self.player_count >= self.max_players
    }

    pub fn is_compatible(&self, network_version: u32) -> bool {
        self.network_version != 0 && self.network_version == network_version
    }
}

/// Snapshot of what is known about a server at `captured_at`.
///
/// A snapshot without `info` is the "none" sentinel: the probe ran at
/// `captured_at` but produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub info: Option<ServerInfo>,
    pub captured_at: DateTime<Utc>,
}

impl SessionDescriptor {
    pub fn new(info: ServerInfo, captured_at: DateTime<Utc>) -> Self {
        Self {
            info: Some(info),
            captured_at,
        }
    }

    pub fn none(captured_at: DateTime<Utc>) -> Self {
        Self {
            info: None,
            captured_at,
        }
    }

    pub fn is_none(&self) -> bool {
        self.info.is_none()
    }

    /// Strictly newer: a snapshot captured exactly at `t` is stale relative to `t`.
    pub fn is_newer_than(&self, t: DateTime<Utc>) -> bool {
        self.captured_at > t
    }
}

/// A join descriptor paired with the latest snapshot known for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedServerEntry {
    pub descriptor: JoinDescriptor,
    pub data: SessionDescriptor,
}

impl CachedServerEntry {
    pub fn new(descriptor: JoinDescriptor, data: SessionDescriptor) -> Self {
        Self { descriptor, data }
    }

    pub fn name(&self) -> Option<&str> {
        self.data.info.as_ref().map(|i| i.name.as_str())
    }
}

/// A row of a persisted server list.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerListEntry {
    pub descriptor: JoinDescriptor,
    /// Cached display name; may be stale
    pub name: String,
    /// When `name` was captured
    pub name_captured_at: DateTime<Utc>,
}

impl ServerListEntry {
    pub fn new(descriptor: JoinDescriptor, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            name: name.into(),
            name_captured_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(d: &JoinDescriptor) -> u64 {
        let mut h = DefaultHasher::new();
        d.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_same_variant_same_payload_is_equal() {
        let a = JoinDescriptor::dedicated("10.0.0.1", 2456);
        let b = JoinDescriptor::dedicated("10.0.0.1", 2456);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = JoinDescriptor::entity("E1");
        let d = JoinDescriptor::entity("E1");
        assert_eq!(c, d);
        assert_eq!(hash_of(&c), hash_of(&d));
    }

    #[test]
    fn test_different_variants_never_equal() {
        let peer = JoinDescriptor::peer(42);
        let entity = JoinDescriptor::entity("42");
        let dedicated = JoinDescriptor::dedicated("42", 42);
        assert_ne!(peer, entity);
        assert_ne!(peer, dedicated);
        assert_ne!(entity, dedicated);
    }

    #[test]
    fn test_validity() {
        assert!(!JoinDescriptor::peer(0).is_valid());
        assert!(!JoinDescriptor::entity("  ").is_valid());
        assert!(!JoinDescriptor::dedicated("host", 0).is_valid());
        assert!(JoinDescriptor::dedicated("host", 1).is_valid());
    }

    #[test]
    fn test_parse_addresses() {
        let v4: JoinDescriptor = "203.0.113.9:2456".parse().unwrap();
        assert_eq!(v4.literal_addr(), Some("203.0.113.9:2456".parse().unwrap()));

        let v6: JoinDescriptor = "[2001:db8::1]:2456".parse().unwrap();
        assert_eq!(v6.to_string(), "[2001:db8::1]:2456");

        let named: JoinDescriptor = "play.example.com:2456".parse().unwrap();
        assert!(named.literal_addr().is_none());

        assert!("no-port".parse::<JoinDescriptor>().is_err());
        assert!(":2456".parse::<JoinDescriptor>().is_err());
    }

    #[test]
    fn test_platform_user_id_forms() {
        let id: PlatformUserId = "Steam_76561198000000001".parse().unwrap();
        assert_eq!(id.platform, Platform::Steam);
        assert_eq!(id.raw_id(), "76561198000000001");
        assert_eq!(id.to_string(), "Steam_76561198000000001");
        assert!("Nope_1".parse::<PlatformUserId>().is_err());
    }

    #[test]
    fn test_staleness_is_strict() {
        let t = Utc::now();
        let snapshot = SessionDescriptor::none(t);
        assert!(!snapshot.is_newer_than(t));
        assert!(snapshot.is_newer_than(t - chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_unknown_network_version_is_incompatible() {
        let info = ServerInfo {
            network_version: 0,
            ..Default::default()
        };
        assert!(!info.is_compatible(0));
        assert!(!info.is_compatible(27));
    }
}
