//! Initiator side of the handshake.

use super::messages::{ClientCredentials, HandshakeMessage, HostWorldInfo, PeerInfo, PeerRole, PROTOCOL_VERSION};
use super::password::password_digest;
use crate::error::{HandshakeError, HandshakeResult};
use crate::types::{PlatformRestriction, PlatformUserId, ServerInfo, Vec3};
use tracing::{debug, info, warn};

/// Who is connecting.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub identity: PlatformUserId,
    pub display_name: String,
    pub session_id: i64,
    pub protocol_version: u32,
    pub version_string: String,
    pub reference_position: Vec3,
    /// Whether the account may play with users of other platforms
    pub crossplay_allowed: bool,
    pub session_ticket: Vec<u8>,
}

impl ClientProfile {
    pub fn new(identity: PlatformUserId, display_name: impl Into<String>, session_ticket: Vec<u8>) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            session_id: 0,
            protocol_version: PROTOCOL_VERSION,
            version_string: env!("CARGO_PKG_VERSION").to_string(),
            reference_position: Vec3::default(),
            crossplay_allowed: true,
            session_ticket,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Connecting,
    AwaitingServerHandshake,
    /// The host wants a password and none was supplied up front.
    AwaitingPassword,
    AwaitingPeerInfo,
    Admitted,
    Failed(HandshakeError),
}

/// State the host synchronized on admission.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub host: PeerInfo,
    pub world: HostWorldInfo,
    pub players: Vec<String>,
    pub admins: Vec<String>,
    pub world_time: f64,
}

pub struct HandshakeClient {
    profile: ClientProfile,
    state: ClientState,
    salt: Option<String>,
    /// Held only until the challenge arrives
    password: Option<String>,
    host: Option<(PeerInfo, HostWorldInfo)>,
    session: Option<SessionSnapshot>,
}

impl HandshakeClient {
    pub fn new(profile: ClientProfile) -> Self {
        Self {
            profile,
            state: ClientState::Connecting,
            salt: None,
            password: None,
            host: None,
            session: None,
        }
    }

    /// Supplies the password before connecting, e.g. from the command line.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn is_admitted(&self) -> bool {
        self.state == ClientState::Admitted
    }

    pub fn error(&self) -> Option<HandshakeError> {
        match self.state {
            ClientState::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&SessionSnapshot> {
        self.session.as_ref()
    }

    /// Checks the target's platform rules before any connection is made.
    pub fn preflight(&self, target: &ServerInfo) -> HandshakeResult<()> {
        match target.platform_restriction {
            PlatformRestriction::Only(platform) if platform != self.profile.identity.platform => {
                Err(HandshakeError::PlatformExcluded)
            }
            PlatformRestriction::Any if !self.profile.crossplay_allowed => {
                Err(HandshakeError::CrossplayPrivilegeDenied)
            }
            _ => Ok(()),
        }
    }

    /// The transport is up; returns the opening request.
    pub fn on_connected(&mut self) -> Vec<HandshakeMessage> {
        if self.state != ClientState::Connecting {
            return Vec::new();
        }
        self.state = ClientState::AwaitingServerHandshake;
        vec![HandshakeMessage::Request]
    }

    pub fn on_connect_failed(&mut self) {
        self.fail(HandshakeError::ConnectFailed);
    }

    /// The transport closed. Fails any handshake still in progress and ends
    /// an admitted session.
    pub fn on_disconnected(&mut self) {
        if !matches!(self.state, ClientState::Failed(_)) {
            self.fail(HandshakeError::Disconnected);
        }
    }

    pub fn handle(&mut self, message: HandshakeMessage) -> Vec<HandshakeMessage> {
        let state = self.state.clone();
        match (state, message) {
            (_, HandshakeMessage::Error { code }) => {
                self.fail(HandshakeError::from_code(code).unwrap_or(HandshakeError::Disconnected));
                Vec::new()
            }
            (ClientState::AwaitingServerHandshake, HandshakeMessage::Challenge { need_password, salt }) => {
                debug!(need_password, "Received handshake challenge");
                if !need_password {
                    self.password = None;
                    return vec![self.peer_info(String::new())];
                }
                self.salt = Some(salt);
                match self.password.take() {
                    Some(password) => self.send_password(&password),
                    None => {
                        self.state = ClientState::AwaitingPassword;
                        Vec::new()
                    }
                }
            }
            (ClientState::AwaitingPeerInfo, HandshakeMessage::PeerInfo(host)) => {
                if host.protocol_version != self.profile.protocol_version {
                    self.fail(HandshakeError::VersionMismatch);
                    return vec![HandshakeMessage::Error {
                        code: HandshakeError::VersionMismatch.code(),
                    }];
                }
                let PeerRole::Host(world) = host.role.clone() else {
                    self.fail(HandshakeError::Disconnected);
                    return Vec::new();
                };
                self.host = Some((host, world));
                Vec::new()
            }
            (
                ClientState::AwaitingPeerInfo,
                HandshakeMessage::Admitted {
                    players,
                    admins,
                    world_time,
                },
            ) => {
                match self.host.take() {
                    Some((host, world)) => {
                        info!("🔗 Joined {} ({})", world.world_name, host.display_name);
                        self.session = Some(SessionSnapshot {
                            host,
                            world,
                            players,
                            admins,
                            world_time,
                        });
                        self.state = ClientState::Admitted;
                    }
                    None => self.fail(HandshakeError::Disconnected),
                }
                Vec::new()
            }
            (state, other) => {
                warn!(?state, ?other, "Unexpected handshake message");
                self.fail(HandshakeError::Disconnected);
                Vec::new()
            }
        }
    }

    /// Answers a password prompt. The plaintext is hashed and dropped.
    pub fn supply_password(&mut self, password: &str) -> Vec<HandshakeMessage> {
        if self.state != ClientState::AwaitingPassword {
            return Vec::new();
        }
        self.send_password(password)
    }

    fn send_password(&mut self, password: &str) -> Vec<HandshakeMessage> {
        let salt = self.salt.as_deref().unwrap_or_default();
        let digest = password_digest(password, salt);
        vec![self.peer_info(digest)]
    }

    fn peer_info(&mut self, password_digest: String) -> HandshakeMessage {
        self.state = ClientState::AwaitingPeerInfo;
        HandshakeMessage::PeerInfo(PeerInfo {
            session_id: self.profile.session_id,
            version_string: self.profile.version_string.clone(),
            protocol_version: self.profile.protocol_version,
            reference_position: self.profile.reference_position,
            display_name: self.profile.display_name.clone(),
            role: PeerRole::Client(ClientCredentials {
                password_digest,
                session_ticket: self.profile.session_ticket.clone(),
            }),
        })
    }

    fn fail(&mut self, error: HandshakeError) {
        if self.state != ClientState::Failed(error) {
            info!("❌ Handshake failed: {}", error);
        }
        self.password = None;
        self.state = ClientState::Failed(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::access::AccessLists;
    use crate::handshake::host::{AdmissionPolicy, HandshakeHost, HostOutcome, KeyedTicketVerifier};
    use crate::types::Platform;

    const KEY: &[u8] = b"shared";

    fn host(password: Option<&str>) -> HandshakeHost {
        let mut policy = AdmissionPolicy::new(
            "Host",
            HostWorldInfo {
                world_name: "Midgard".to_string(),
                seed: 1,
                seed_name: "seed".to_string(),
                world_uid: 2,
                world_gen_version: 3,
                net_time: 0.0,
            },
        );
        policy.password = password.map(str::to_string);
        HandshakeHost::new(policy, AccessLists::default(), Box::new(KeyedTicketVerifier::new(KEY)))
    }

    fn client(id: &str) -> HandshakeClient {
        let identity = PlatformUserId::new(Platform::Steam, id);
        let ticket = KeyedTicketVerifier::new(KEY).issue(&identity);
        HandshakeClient::new(ClientProfile::new(identity, "Ragnar", ticket))
    }

    /// Shuttles messages between both sides until neither has anything to send.
    fn run(host: &mut HandshakeHost, client: &mut HandshakeClient, outgoing: Vec<HandshakeMessage>) -> HostOutcome {
        let mut outcome = HostOutcome::Pending;
        let mut to_host = outgoing;
        while !to_host.is_empty() {
            let mut to_client = Vec::new();
            for message in to_host.drain(..) {
                let reply = host.handle(1, message);
                outcome = reply.outcome;
                to_client.extend(reply.messages);
            }
            for message in to_client {
                to_host.extend(client.handle(message));
            }
        }
        outcome
    }

    #[test]
    fn test_full_handshake_with_prompted_password() {
        let mut host = host(Some("secret"));
        let mut client = client("1");
        host.connect(1, PlatformUserId::new(Platform::Steam, "1"));

        let hello = client.on_connected();
        run(&mut host, &mut client, hello);
        assert_eq!(client.state(), &ClientState::AwaitingPassword);

        let answer = client.supply_password("secret");
        let outcome = run(&mut host, &mut client, answer);
        assert!(matches!(outcome, HostOutcome::Admitted(_)));
        assert!(client.is_admitted());
        let session = client.session().unwrap();
        assert_eq!(session.world.world_name, "Midgard");
        assert_eq!(session.players, vec!["Ragnar".to_string()]);
    }

    #[test]
    fn test_wrong_password_reported() {
        let mut host = host(Some("secret"));
        let mut client = client("1").with_password("guess");
        host.connect(1, PlatformUserId::new(Platform::Steam, "1"));

        let hello = client.on_connected();
        run(&mut host, &mut client, hello);
        assert_eq!(client.error(), Some(HandshakeError::WrongPassword));
    }

    #[test]
    fn test_preflight_platform_rules() {
        let mut client = client("1");
        let mut target = ServerInfo {
            platform_restriction: PlatformRestriction::Only(Platform::Xbox),
            ..Default::default()
        };
        assert_eq!(client.preflight(&target), Err(HandshakeError::PlatformExcluded));

        target.platform_restriction = PlatformRestriction::Any;
        assert_eq!(client.preflight(&target), Ok(()));
        client.profile.crossplay_allowed = false;
        assert_eq!(client.preflight(&target), Err(HandshakeError::CrossplayPrivilegeDenied));

        target.platform_restriction = PlatformRestriction::Only(Platform::Steam);
        assert_eq!(client.preflight(&target), Ok(()));
    }

    #[test]
    fn test_kick_after_admission() {
        let mut host = host(None);
        let mut client = client("1");
        let identity = PlatformUserId::new(Platform::Steam, "1");
        host.connect(1, identity.clone());
        let hello = client.on_connected();
        run(&mut host, &mut client, hello);
        assert!(client.is_admitted());

        let (_, kick) = host.kick(&identity).unwrap();
        client.handle(kick);
        assert_eq!(client.error(), Some(HandshakeError::Kicked));
    }

    #[test]
    fn test_connect_failure_and_disconnect() {
        let mut a = client("1");
        a.on_connect_failed();
        assert_eq!(a.error(), Some(HandshakeError::ConnectFailed));
        a.on_disconnected();
        assert_eq!(a.error(), Some(HandshakeError::ConnectFailed));

        let mut b = client("2");
        b.on_connected();
        b.on_disconnected();
        assert_eq!(b.error(), Some(HandshakeError::Disconnected));
    }
}
