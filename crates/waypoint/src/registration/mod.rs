//! # Session registration and recovery
//!
//! Hosting on the entity-session provider walks through
//!
//! ```text
//! Uninitialized -> CreatingNetwork -> CreatingLobby -> CheckingJoinCode -> Active
//!                                                       ^            |
//!                                                       |            v
//!                                                  RegeneratingJoinCode
//! ```
//!
//! Join codes are short random numbers, so after the lobby is created the
//! registrar searches for every lobby advertising the same code and picks a
//! new one until it is the only owner. Once active, the lobby is refreshed
//! at a random point inside the refresh window and republished as soon as
//! the public address becomes known.
//!
//! A lost network session moves the registrar to `Recovering`: it waits
//! (shorter for fast-recovery reasons), forces a reset halfway through long
//! waits, then rebuilds network and lobby from scratch. Failed requests are
//! retried separately through [`RetryPolicy`].
//!
//! The registrar does not own the provider. The owning backend passes the
//! service into every call and routes provider events and join-code search
//! results back in.

mod retry;

pub use retry::RetryPolicy;

use crate::backend::service::{
    EntitySessionEvent, EntitySessionService, LobbyId, NetworkId, RequestId, SearchFilter,
    SearchQuery, SessionRecord,
};
use crate::config::MatchmakingConfig;
use crate::error::{MatchmakingError, ServiceError};
use crate::types::{EntityId, PlatformRestriction, PlatformUserId, ServerInfo};
use rand::Rng;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const JOIN_CODE_LENGTH: usize = 6;

/// Produces candidate join codes.
pub type JoinCodeSource = Box<dyn FnMut() -> String + Send>;

/// A random zero-padded numeric code of [`JOIN_CODE_LENGTH`] digits.
pub fn generate_join_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{code:06}")
}

/// What a host advertises about its session.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    pub name: String,
    pub max_players: u32,
    pub password_protected: bool,
    pub game_version: String,
    pub network_version: u32,
    pub platform_restriction: PlatformRestriction,
    pub modifiers: Vec<String>,
    /// Game port published together with the public address
    pub port: u16,
    pub host_id: Option<PlatformUserId>,
}

impl HostSettings {
    pub fn new(name: impl Into<String>, config: &MatchmakingConfig) -> Self {
        Self {
            name: name.into(),
            max_players: config.max_players,
            password_protected: false,
            game_version: config.game_version.clone(),
            network_version: config.network_version,
            platform_restriction: PlatformRestriction::Any,
            modifiers: Vec::new(),
            port: 2456,
            host_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationState {
    Uninitialized,
    CreatingNetwork,
    CreatingLobby,
    CheckingJoinCode,
    RegeneratingJoinCode,
    Active,
    Recovering,
    Failed(MatchmakingError),
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Uninitialized => f.write_str("uninitialized"),
            RegistrationState::CreatingNetwork => f.write_str("creating network"),
            RegistrationState::CreatingLobby => f.write_str("creating lobby"),
            RegistrationState::CheckingJoinCode => f.write_str("checking join code"),
            RegistrationState::RegeneratingJoinCode => f.write_str("regenerating join code"),
            RegistrationState::Active => f.write_str("active"),
            RegistrationState::Recovering => f.write_str("recovering"),
            RegistrationState::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryStep {
    Network,
    Lobby,
    Check,
    Regenerate,
}

#[derive(Debug, Clone, Copy)]
struct Recovery {
    elapsed: Duration,
    wait: Duration,
    /// Point in the wait at which stale handles are torn down early
    forced_reset_at: Option<Duration>,
}

pub struct SessionRegistrar {
    settings: HostSettings,
    config: MatchmakingConfig,
    retry: RetryPolicy,
    codes: JoinCodeSource,
    state: RegistrationState,
    join_code: Option<String>,
    regenerations: u32,
    failures: u32,
    network: Option<NetworkId>,
    lobby: Option<LobbyId>,
    outstanding: Option<RequestId>,
    pending_search: Option<SearchQuery>,
    awaiting_search: bool,
    retry_timer: Option<(Duration, RetryStep)>,
    refresh_timer: Option<Duration>,
    recovery: Option<Recovery>,
    player_count: u32,
    details_dirty: bool,
    public_ip: Option<IpAddr>,
    published_ip: Option<IpAddr>,
    last_error: Option<MatchmakingError>,
}

impl SessionRegistrar {
    pub fn new(settings: HostSettings, config: MatchmakingConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            settings,
            config,
            retry,
            codes: Box::new(generate_join_code),
            state: RegistrationState::Uninitialized,
            join_code: None,
            regenerations: 0,
            failures: 0,
            network: None,
            lobby: None,
            outstanding: None,
            pending_search: None,
            awaiting_search: false,
            retry_timer: None,
            refresh_timer: None,
            recovery: None,
            player_count: 0,
            details_dirty: false,
            public_ip: None,
            published_ip: None,
            last_error: None,
        }
    }

    /// Replaces the random join-code generator.
    pub fn with_join_codes(mut self, codes: JoinCodeSource) -> Self {
        self.codes = codes;
        self
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == RegistrationState::Active
    }

    pub fn join_code(&self) -> Option<&str> {
        self.join_code.as_deref()
    }

    pub fn network(&self) -> Option<&NetworkId> {
        self.network.as_ref()
    }

    pub fn lobby(&self) -> Option<&LobbyId> {
        self.lobby.as_ref()
    }

    pub fn regenerations(&self) -> u32 {
        self.regenerations
    }

    /// Why registration last left the happy path. Cleared once active.
    pub fn last_error(&self) -> Option<&MatchmakingError> {
        self.last_error.as_ref()
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    /// The session details as currently advertised.
    pub fn advertised_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.settings.name.clone(),
            player_count: self.player_count,
            max_players: self.settings.max_players,
            host_id: self.settings.host_id.clone(),
            host_peer: None,
            game_version: self.settings.game_version.clone(),
            network_version: self.settings.network_version,
            join_code: self.join_code.clone(),
            password_protected: self.settings.password_protected,
            platform_restriction: self.settings.platform_restriction,
            modifiers: self.settings.modifiers.clone(),
            endpoint: self
                .public_ip
                .map(|ip| SocketAddr::new(ip, self.settings.port)),
        }
    }

    pub fn set_player_count(&mut self, count: u32) {
        if self.player_count != count {
            self.player_count = count;
            self.details_dirty = true;
        }
    }

    pub fn observe_public_ip(&mut self, ip: IpAddr) {
        if self.public_ip != Some(ip) {
            info!("🌐 Public address known: {}", ip);
            self.public_ip = Some(ip);
        }
    }

    /// Starts (or restarts after failure) registration.
    pub fn start(&mut self, service: &mut dyn EntitySessionService) {
        match self.state {
            RegistrationState::Uninitialized | RegistrationState::Failed(_) => {}
            _ => {
                debug!(state = %self.state, "Registration already running");
                return;
            }
        }
        self.reset_progress();
        self.begin_network(service);
    }

    /// Leaves lobby and network and returns to `Uninitialized`.
    pub fn stop(&mut self, service: &mut dyn EntitySessionService) {
        self.teardown(service);
        self.reset_progress();
        self.join_code = None;
        self.transition(RegistrationState::Uninitialized);
    }

    /// A join-code search the owner must submit on the registrar's behalf.
    pub fn take_search(&mut self) -> Option<SearchQuery> {
        self.pending_search.take()
    }

    /// Routes a provider event. Returns true if the event belonged to this
    /// registrar.
    pub fn handle_event(&mut self, event: &EntitySessionEvent, service: &mut dyn EntitySessionService) -> bool {
        match event {
            EntitySessionEvent::NetworkCreated { request, result } if self.owns(*request) => {
                self.outstanding = None;
                match result {
                    Ok(network) => {
                        info!("🔗 Network session created: {}", network);
                        self.network = Some(network.clone());
                        self.failures = 0;
                        self.begin_lobby(service);
                    }
                    Err(e) => self.request_failed(e.clone(), RetryStep::Network, service),
                }
                true
            }
            EntitySessionEvent::LobbyCreated { request, result } if self.owns(*request) => {
                self.outstanding = None;
                match result {
                    Ok(lobby) => {
                        info!("🏠 Lobby created: {}", lobby);
                        self.lobby = Some(lobby.clone());
                        self.failures = 0;
                        self.begin_check();
                    }
                    Err(e) => self.request_failed(e.clone(), RetryStep::Lobby, service),
                }
                true
            }
            EntitySessionEvent::LobbyUpdated { request, result } if self.owns(*request) => {
                self.outstanding = None;
                match (&self.state, result) {
                    (RegistrationState::RegeneratingJoinCode, Ok(())) => self.begin_check(),
                    (RegistrationState::RegeneratingJoinCode, Err(e)) => {
                        self.request_failed(e.clone(), RetryStep::Regenerate, service)
                    }
                    (_, Ok(())) => debug!("Lobby details refreshed"),
                    (_, Err(e)) => {
                        warn!("Lobby refresh failed: {}", e);
                        self.refresh_timer = Some(self.retry.delay(1));
                    }
                }
                true
            }
            EntitySessionEvent::NetworkDisconnected { network, reason }
                if self.network.as_ref() == Some(network) =>
            {
                let wait = if reason.allows_fast_recovery() {
                    self.config.fast_reconnect_delay()
                } else {
                    self.config.reconnect_delay()
                };
                let forced_reset_at = (wait > self.config.forced_reset_threshold()).then(|| wait / 2);
                warn!(?reason, "Network session lost, reconnecting in {:?}", wait);

                self.outstanding = None;
                self.pending_search = None;
                self.awaiting_search = false;
                self.retry_timer = None;
                self.refresh_timer = None;
                self.recovery = Some(Recovery {
                    elapsed: Duration::ZERO,
                    wait,
                    forced_reset_at,
                });
                self.last_error = Some(MatchmakingError::NetworkLost);
                self.transition(RegistrationState::Recovering);
                true
            }
            _ => false,
        }
    }

    /// Resolves the join-code uniqueness search.
    pub fn on_join_code_search(
        &mut self,
        result: Result<Vec<SessionRecord>, ServiceError>,
        local: Option<&EntityId>,
        service: &mut dyn EntitySessionService,
    ) {
        if self.state != RegistrationState::CheckingJoinCode || !self.awaiting_search {
            debug!("Discarding join-code search result outside of check");
            return;
        }
        self.awaiting_search = false;

        let records = match result {
            Ok(records) => records,
            Err(e) => return self.request_failed(e, RetryStep::Check, service),
        };

        let foreign = records.iter().any(|r| Some(&r.owner) != local);
        if records.len() > 1 || foreign {
            debug!(
                code = self.join_code.as_deref().unwrap_or_default(),
                found = records.len(),
                "Join code collides"
            );
            self.regenerate(service);
        } else {
            self.activate();
        }
    }

    pub fn tick(&mut self, dt: Duration, service: &mut dyn EntitySessionService) {
        if let Some((remaining, step)) = self.retry_timer.as_mut() {
            *remaining = remaining.saturating_sub(dt);
            if remaining.is_zero() {
                let step = *step;
                self.retry_timer = None;
                self.retry(step, service);
            }
        }

        if let Some(recovery) = self.recovery.as_mut() {
            recovery.elapsed += dt;
            let elapsed = recovery.elapsed;
            let wait = recovery.wait;
            if let Some(at) = recovery.forced_reset_at {
                if elapsed >= at && elapsed < wait {
                    recovery.forced_reset_at = None;
                    info!("Forcing network reset while waiting to reconnect");
                    self.teardown(service);
                }
            }
            if elapsed >= wait {
                self.recovery = None;
                self.teardown(service);
                self.reset_progress();
                self.join_code = None;
                info!("Recreating network session");
                self.begin_network(service);
            }
            return;
        }

        if self.state != RegistrationState::Active {
            return;
        }
        if let Some(remaining) = self.refresh_timer.as_mut() {
            *remaining = remaining.saturating_sub(dt);
        }

        let refresh_due = self.refresh_timer.is_some_and(|r| r.is_zero());
        let address_changed = self.public_ip.is_some() && self.public_ip != self.published_ip;
        if self.outstanding.is_none() && (refresh_due || address_changed || self.details_dirty) {
            self.send_update(service);
            self.published_ip = self.public_ip;
            self.details_dirty = false;
            self.schedule_refresh();
        }
    }

    fn owns(&self, request: RequestId) -> bool {
        self.outstanding == Some(request)
    }

    fn transition(&mut self, next: RegistrationState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Registration state change");
            self.state = next;
        }
    }

    fn reset_progress(&mut self) {
        self.regenerations = 0;
        self.failures = 0;
        self.outstanding = None;
        self.pending_search = None;
        self.awaiting_search = false;
        self.retry_timer = None;
        self.refresh_timer = None;
        self.recovery = None;
        self.published_ip = None;
    }

    fn teardown(&mut self, service: &mut dyn EntitySessionService) {
        if let Some(lobby) = self.lobby.take() {
            service.leave_lobby(&lobby);
        }
        if let Some(network) = self.network.take() {
            service.leave_network(&network);
        }
    }

    fn begin_network(&mut self, service: &mut dyn EntitySessionService) {
        self.transition(RegistrationState::CreatingNetwork);
        self.outstanding = Some(service.create_network());
    }

    fn begin_lobby(&mut self, service: &mut dyn EntitySessionService) {
        let Some(network) = self.network.clone() else {
            return self.begin_network(service);
        };
        if self.join_code.is_none() {
            self.join_code = Some((self.codes)());
        }
        self.transition(RegistrationState::CreatingLobby);
        let info = self.advertised_info();
        self.outstanding = Some(service.create_lobby(&network, &info));
    }

    fn begin_check(&mut self) {
        let Some(code) = self.join_code.clone() else {
            return;
        };
        self.transition(RegistrationState::CheckingJoinCode);
        self.pending_search = Some(SearchQuery::new(SearchFilter::JoinCode(code)));
        self.awaiting_search = true;
    }

    fn send_update(&mut self, service: &mut dyn EntitySessionService) {
        if let Some(lobby) = self.lobby.clone() {
            let info = self.advertised_info();
            self.outstanding = Some(service.update_lobby(&lobby, &info));
        }
    }

    fn regenerate(&mut self, service: &mut dyn EntitySessionService) {
        self.regenerations += 1;
        if self.regenerations > self.config.join_code_retries {
            let code = self.join_code.clone().unwrap_or_default();
            warn!("Join code {} still collides after {} retries, unregistering", code, self.config.join_code_retries);
            self.teardown(service);
            self.transition(RegistrationState::Failed(MatchmakingError::LobbyCollision(code)));
            return;
        }

        self.join_code = Some((self.codes)());
        self.transition(RegistrationState::RegeneratingJoinCode);
        self.send_update(service);
    }

    fn activate(&mut self) {
        self.failures = 0;
        self.last_error = None;
        self.published_ip = self.public_ip;
        self.details_dirty = false;
        self.schedule_refresh();
        self.transition(RegistrationState::Active);
        info!(
            "✅ Session registered with join code {}",
            self.join_code.as_deref().unwrap_or_default()
        );
    }

    fn schedule_refresh(&mut self) {
        let (min, max) = self.config.lobby_refresh_window();
        let secs = rand::thread_rng().gen_range(min.as_secs()..=max.as_secs());
        self.refresh_timer = Some(Duration::from_secs(secs));
    }

    fn request_failed(&mut self, error: ServiceError, step: RetryStep, service: &mut dyn EntitySessionService) {
        self.failures += 1;
        let error = MatchmakingError::from(error);
        if self.failures >= self.config.registration_max_attempts {
            warn!("Registration gave up after {} failures: {}", self.failures, error);
            self.teardown(service);
            self.last_error = Some(error.clone());
            self.transition(RegistrationState::Failed(error));
            return;
        }
        let delay = self.retry.delay(self.failures);
        warn!(?step, attempt = self.failures, "Registration request failed ({}), retrying in {:?}", error, delay);
        self.last_error = Some(error);
        self.retry_timer = Some((delay, step));
    }

    fn retry(&mut self, step: RetryStep, service: &mut dyn EntitySessionService) {
        match step {
            RetryStep::Network => self.begin_network(service),
            RetryStep::Lobby => self.begin_lobby(service),
            RetryStep::Check => self.begin_check(),
            RetryStep::Regenerate => self.send_update(service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::service::DisconnectReason;
    use crate::memory::{MemorySessionService, SessionDirectory};

    /// Stands in for the owning backend: submits searches and routes events.
    fn drive(registrar: &mut SessionRegistrar, service: &mut MemorySessionService, dt: Duration) {
        registrar.tick(dt, service);
        let search = registrar.take_search().map(|q| service.submit_search(&q));
        for event in service.poll_events() {
            match event {
                EntitySessionEvent::SearchCompleted { request, result } if Some(request) == search => {
                    let local = service.local_entity();
                    registrar.on_join_code_search(result.map(|p| p.records), local.as_ref(), service);
                }
                other => {
                    registrar.handle_event(&other, service);
                }
            }
        }
    }

    fn registrar() -> SessionRegistrar {
        let config = MatchmakingConfig::default();
        SessionRegistrar::new(HostSettings::new("Test World", &config), config)
    }

    #[test]
    fn test_generated_codes_are_six_digits() {
        for _ in 0..50 {
            let code = generate_join_code();
            assert_eq!(code.len(), JOIN_CODE_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_registers_when_code_is_free() {
        let directory = SessionDirectory::new();
        let mut service = directory.connect("host-entity");
        let mut registrar = registrar();

        registrar.start(&mut service);
        assert_eq!(registrar.state(), &RegistrationState::CreatingNetwork);
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }
        assert!(registrar.is_active());
        assert_eq!(directory.sessions().len(), 1);
    }

    #[test]
    fn test_failed_network_creation_is_retried() {
        let directory = SessionDirectory::new();
        directory.fail_next_networks(1);
        let mut service = directory.connect("host-entity");
        let mut registrar = registrar();

        registrar.start(&mut service);
        drive(&mut registrar, &mut service, Duration::ZERO);
        assert_eq!(registrar.state(), &RegistrationState::CreatingNetwork);
        assert!(registrar.network().is_none());
        assert!(matches!(
            registrar.last_error(),
            Some(MatchmakingError::Service(ServiceError::Failed(_)))
        ));

        // First retry waits at most base (2s) * jitter <= 2s.
        drive(&mut registrar, &mut service, Duration::from_secs(2));
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }
        assert!(registrar.is_active());
    }

    #[test]
    fn test_disconnect_forces_reset_then_recreates() {
        let directory = SessionDirectory::new();
        let mut service = directory.connect("host-entity");
        let mut registrar = registrar();
        registrar.start(&mut service);
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }
        assert!(registrar.is_active());

        directory.disconnect_networks(DisconnectReason::NetworkTimeout);
        drive(&mut registrar, &mut service, Duration::ZERO);
        assert_eq!(registrar.state(), &RegistrationState::Recovering);
        assert_eq!(registrar.last_error(), Some(&MatchmakingError::NetworkLost));
        assert!(registrar.lobby().is_some());

        // Half of the 30s wait: stale handles are dropped early.
        drive(&mut registrar, &mut service, Duration::from_secs(15));
        assert_eq!(registrar.state(), &RegistrationState::Recovering);
        assert!(registrar.lobby().is_none());
        assert!(directory.sessions().is_empty());

        drive(&mut registrar, &mut service, Duration::from_secs(15));
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }
        assert!(registrar.is_active());
        assert!(registrar.last_error().is_none());
        assert_eq!(directory.sessions().len(), 1);
    }

    #[test]
    fn test_fast_recovery_skips_forced_reset() {
        let directory = SessionDirectory::new();
        let mut service = directory.connect("host-entity");
        let mut registrar = registrar();
        registrar.start(&mut service);
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }

        directory.disconnect_networks(DisconnectReason::TransportReset);
        drive(&mut registrar, &mut service, Duration::ZERO);
        drive(&mut registrar, &mut service, Duration::from_secs(3));
        assert!(registrar.lobby().is_some());

        // Network recreated on this tick; the lobby request goes out next.
        drive(&mut registrar, &mut service, Duration::from_secs(2));
        assert_eq!(registrar.state(), &RegistrationState::CreatingLobby);
    }

    #[test]
    fn test_public_address_is_republished() {
        let directory = SessionDirectory::new();
        let mut service = directory.connect("host-entity");
        let mut registrar = registrar();
        registrar.start(&mut service);
        for _ in 0..4 {
            drive(&mut registrar, &mut service, Duration::from_millis(100));
        }
        assert!(directory.sessions()[0].info.endpoint.is_none());

        registrar.observe_public_ip("203.0.113.9".parse().unwrap());
        drive(&mut registrar, &mut service, Duration::from_millis(100));
        drive(&mut registrar, &mut service, Duration::from_millis(100));
        assert_eq!(
            directory.sessions()[0].info.endpoint,
            Some("203.0.113.9:2456".parse().unwrap())
        );
    }
}
