//! Responder side of the handshake.
//!
//! The host answers a connection's request with its password requirement
//! and salt. It then validates the peer info it receives, stopping at the
//! first failed check, in this order:
//!
//! 1. protocol version
//! 2. ban list, then allow list
//! 3. platform restriction
//! 4. session ticket against the identity the transport claims
//! 5. capacity
//! 6. password digest
//! 7. duplicate session
//!
//! A failure answers with the error's wire code and forgets the connection.

use super::access::AccessLists;
use super::messages::{HandshakeMessage, HostWorldInfo, PeerInfo, PeerRole, PROTOCOL_VERSION};
use super::password::{bytes_match, digests_match, generate_salt, password_digest};
use crate::error::{HandshakeError, HandshakeResult};
use crate::types::{PlatformRestriction, PlatformUserId, Vec3};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Checks that a session ticket was issued to the claimed identity.
pub trait TicketVerifier: Send {
    fn verify(&self, claimed: &PlatformUserId, ticket: &[u8]) -> bool;
}

impl<F> TicketVerifier for F
where
    F: Fn(&PlatformUserId, &[u8]) -> bool + Send,
{
    fn verify(&self, claimed: &PlatformUserId, ticket: &[u8]) -> bool {
        self(claimed, ticket)
    }
}

/// Tickets are `SHA-256(key + identity)`, shared-key style.
#[derive(Debug, Clone)]
pub struct KeyedTicketVerifier {
    key: Vec<u8>,
}

impl KeyedTicketVerifier {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn issue(&self, id: &PlatformUserId) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(id.to_string().as_bytes());
        hasher.finalize().to_vec()
    }
}

impl TicketVerifier for KeyedTicketVerifier {
    fn verify(&self, claimed: &PlatformUserId, ticket: &[u8]) -> bool {
        bytes_match(&self.issue(claimed), ticket)
    }
}

/// What the host enforces and advertises.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub protocol_version: u32,
    pub version_string: String,
    pub display_name: String,
    pub session_id: i64,
    pub reference_position: Vec3,
    pub max_players: u32,
    pub password: Option<String>,
    pub platform_restriction: PlatformRestriction,
    pub world: HostWorldInfo,
}

impl AdmissionPolicy {
    pub fn new(display_name: impl Into<String>, world: HostWorldInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            version_string: env!("CARGO_PKG_VERSION").to_string(),
            display_name: display_name.into(),
            session_id: 0,
            reference_position: Vec3::default(),
            max_players: 10,
            password: None,
            platform_restriction: PlatformRestriction::Any,
            world,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostOutcome {
    /// The connection is still mid-handshake.
    Pending,
    Admitted(PlatformUserId),
    Rejected(HandshakeError),
}

/// Messages to send back plus what happened to the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct HostReply {
    pub messages: Vec<HandshakeMessage>,
    pub outcome: HostOutcome,
}

impl HostReply {
    fn pending(message: HandshakeMessage) -> Self {
        Self {
            messages: vec![message],
            outcome: HostOutcome::Pending,
        }
    }

    fn rejected(error: HandshakeError) -> Self {
        Self {
            messages: vec![HandshakeMessage::Error { code: error.code() }],
            outcome: HostOutcome::Rejected(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingRequest,
    AwaitingPeerInfo,
}

#[derive(Debug)]
struct PendingConnection {
    claimed: PlatformUserId,
    phase: Phase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedPeer {
    pub connection: ConnectionId,
    pub identity: PlatformUserId,
    pub display_name: String,
    pub session_id: i64,
    pub reference_position: Vec3,
}

pub struct HandshakeHost {
    policy: AdmissionPolicy,
    access: AccessLists,
    verifier: Box<dyn TicketVerifier>,
    /// Generated once and reused for every connection this session
    salt: String,
    expected_digest: Option<String>,
    pending: HashMap<ConnectionId, PendingConnection>,
    peers: HashMap<ConnectionId, AdmittedPeer>,
    world_time: f64,
}

impl HandshakeHost {
    pub fn new(policy: AdmissionPolicy, access: AccessLists, verifier: Box<dyn TicketVerifier>) -> Self {
        let salt = generate_salt();
        let expected_digest = policy
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| password_digest(p, &salt));
        let world_time = policy.world.net_time;
        Self {
            policy,
            access,
            verifier,
            salt,
            expected_digest,
            pending: HashMap::new(),
            peers: HashMap::new(),
            world_time,
        }
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn needs_password(&self) -> bool {
        self.expected_digest.is_some()
    }

    pub fn access(&self) -> &AccessLists {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut AccessLists {
        &mut self.access
    }

    pub fn peers(&self) -> impl Iterator<Item = &AdmittedPeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn world_time(&self) -> f64 {
        self.world_time
    }

    /// Registers a transport connection and the identity it claims.
    pub fn connect(&mut self, connection: ConnectionId, claimed: PlatformUserId) {
        debug!(connection, %claimed, "Handshake started");
        self.pending.insert(
            connection,
            PendingConnection {
                claimed,
                phase: Phase::AwaitingRequest,
            },
        );
    }

    pub fn handle(&mut self, connection: ConnectionId, message: HandshakeMessage) -> HostReply {
        let Some(phase) = self.pending.get(&connection).map(|p| p.phase) else {
            warn!(connection, "Handshake message from unknown connection");
            return HostReply::rejected(HandshakeError::Disconnected);
        };

        match (phase, message) {
            (Phase::AwaitingRequest, HandshakeMessage::Request) => {
                if let Some(pending) = self.pending.get_mut(&connection) {
                    pending.phase = Phase::AwaitingPeerInfo;
                }
                HostReply::pending(HandshakeMessage::Challenge {
                    need_password: self.needs_password(),
                    salt: self.salt.clone(),
                })
            }
            (Phase::AwaitingPeerInfo, HandshakeMessage::PeerInfo(info)) => self.admit(connection, info),
            (_, HandshakeMessage::Error { code }) => {
                debug!(connection, code, "Peer aborted handshake");
                self.pending.remove(&connection);
                HostReply {
                    messages: Vec::new(),
                    outcome: HostOutcome::Rejected(
                        HandshakeError::from_code(code).unwrap_or(HandshakeError::Disconnected),
                    ),
                }
            }
            (phase, other) => {
                warn!(connection, ?phase, ?other, "Unexpected handshake message");
                self.pending.remove(&connection);
                HostReply::rejected(HandshakeError::Disconnected)
            }
        }
    }

    fn admit(&mut self, connection: ConnectionId, info: PeerInfo) -> HostReply {
        let Some(pending) = self.pending.remove(&connection) else {
            return HostReply::rejected(HandshakeError::Disconnected);
        };
        let claimed = pending.claimed;

        if let Err(error) = self.validate(&claimed, &info) {
            info!("🚫 Rejected {} ({}): {}", info.display_name, claimed, error);
            return HostReply::rejected(error);
        }

        info!("✅ Admitted {} ({}) on connection {}", info.display_name, claimed, connection);
        self.peers.insert(
            connection,
            AdmittedPeer {
                connection,
                identity: claimed.clone(),
                display_name: info.display_name,
                session_id: info.session_id,
                reference_position: info.reference_position,
            },
        );

        let mut players: Vec<String> = self.peers.values().map(|p| p.display_name.clone()).collect();
        players.sort();
        HostReply {
            messages: vec![
                HandshakeMessage::PeerInfo(self.own_info()),
                HandshakeMessage::Admitted {
                    players,
                    admins: self.access.admins.iter().map(str::to_string).collect(),
                    world_time: self.world_time,
                },
            ],
            outcome: HostOutcome::Admitted(claimed),
        }
    }

    fn validate(&self, claimed: &PlatformUserId, info: &PeerInfo) -> HandshakeResult<()> {
        if info.protocol_version != self.policy.protocol_version {
            return Err(HandshakeError::VersionMismatch);
        }
        let PeerRole::Client(credentials) = &info.role else {
            return Err(HandshakeError::Disconnected);
        };
        self.access.check(claimed)?;
        if !self.policy.platform_restriction.admits(claimed.platform) {
            return Err(HandshakeError::PlatformExcluded);
        }
        if !self.verifier.verify(claimed, &credentials.session_ticket) {
            return Err(HandshakeError::InvalidSessionTicket);
        }
        if self.peers.len() >= self.policy.max_players as usize {
            return Err(HandshakeError::ServerFull);
        }
        if let Some(expected) = &self.expected_digest {
            if !digests_match(expected, &credentials.password_digest) {
                return Err(HandshakeError::WrongPassword);
            }
        }
        if self.peers.values().any(|p| &p.identity == claimed) {
            return Err(HandshakeError::AlreadyConnected);
        }
        Ok(())
    }

    fn own_info(&self) -> PeerInfo {
        PeerInfo {
            session_id: self.policy.session_id,
            version_string: self.policy.version_string.clone(),
            protocol_version: self.policy.protocol_version,
            reference_position: self.policy.reference_position,
            display_name: self.policy.display_name.clone(),
            role: PeerRole::Host(HostWorldInfo {
                net_time: self.world_time,
                ..self.policy.world.clone()
            }),
        }
    }

    /// Removes an admitted peer and returns the message telling it why.
    pub fn kick(&mut self, identity: &PlatformUserId) -> Option<(ConnectionId, HandshakeMessage)> {
        let connection = self
            .peers
            .values()
            .find(|p| &p.identity == identity)
            .map(|p| p.connection)?;
        self.peers.remove(&connection);
        info!("👢 Kicked {} from connection {}", identity, connection);
        Some((
            connection,
            HandshakeMessage::Error {
                code: HandshakeError::Kicked.code(),
            },
        ))
    }

    /// Bans `identity`, kicking it if connected.
    pub fn ban(&mut self, identity: &PlatformUserId) -> Option<(ConnectionId, HandshakeMessage)> {
        self.access.banned.add(identity);
        self.kick(identity)
    }

    /// Transport closed.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Option<AdmittedPeer> {
        self.pending.remove(&connection);
        let peer = self.peers.remove(&connection);
        if let Some(peer) = &peer {
            info!("👋 {} disconnected", peer.display_name);
        }
        peer
    }

    pub fn tick(&mut self, dt: Duration) {
        self.world_time += dt.as_secs_f64();
    }
}
