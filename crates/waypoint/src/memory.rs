//! In-process session providers and resolver.
//!
//! Each directory is a shared, clonable handle; `connect` hands out service
//! instances that talk to it. Requests are answered on the service's next
//! `poll_events`, so a backend sees its results one tick after sending, the
//! same shape as a real provider. Every request is logged for inspection.

use crate::backend::service::{
    DisconnectReason, EntitySessionEvent, EntitySessionService, LobbyId, LobbyRecord, NetworkId,
    PeerLobbyEvent, PeerLobbyService, RequestId, SearchFilter, SearchPage, SearchQuery,
    SessionRecord,
};
use crate::dns::{HostResolver, LookupResult};
use crate::error::ServiceError;
use crate::types::{EntityId, PeerId, ServerInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

// ============================================================================
// Peer-lobby provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyRequest {
    LobbyList { friends_only: bool },
    LobbyData(PeerId),
    ServerQuery(SocketAddr),
    Cancel(RequestId),
}

#[derive(Debug, Default)]
struct LobbyState {
    lobbies: Vec<LobbyRecord>,
    servers: HashMap<SocketAddr, LobbyRecord>,
    requests: Vec<LobbyRequest>,
    next_request: RequestId,
    unresponsive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LobbyDirectory {
    state: Arc<Mutex<LobbyState>>,
}

impl LobbyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LobbyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advertises a lobby, replacing any lobby with the same owner.
    pub fn publish(&self, record: LobbyRecord) {
        let mut state = self.lock();
        state.lobbies.retain(|l| l.owner != record.owner);
        state.lobbies.push(record);
    }

    pub fn withdraw(&self, owner: PeerId) {
        self.lock().lobbies.retain(|l| l.owner != owner);
    }

    /// Makes a dedicated server answer direct queries at `addr`.
    pub fn register_server(&self, addr: SocketAddr, record: LobbyRecord) {
        self.lock().servers.insert(addr, record);
    }

    /// An unresponsive directory accepts requests but never answers them.
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().unresponsive = !responsive;
    }

    pub fn requests(&self) -> Vec<LobbyRequest> {
        self.lock().requests.clone()
    }

    pub fn connect(&self) -> MemoryLobbyService {
        MemoryLobbyService {
            directory: self.clone(),
            logged_in: true,
            outbox: Vec::new(),
        }
    }

    pub fn connect_logged_out(&self) -> MemoryLobbyService {
        MemoryLobbyService {
            logged_in: false,
            ..self.connect()
        }
    }
}

pub struct MemoryLobbyService {
    directory: LobbyDirectory,
    logged_in: bool,
    outbox: Vec<(RequestId, LobbyRequest)>,
}

impl MemoryLobbyService {
    fn send(&mut self, request: LobbyRequest) -> RequestId {
        let id = {
            let mut state = self.directory.lock();
            state.next_request += 1;
            state.requests.push(request.clone());
            state.next_request
        };
        self.outbox.push((id, request));
        id
    }
}

impl PeerLobbyService for MemoryLobbyService {
    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn request_lobby_list(&mut self, friends_only: bool) -> RequestId {
        self.send(LobbyRequest::LobbyList { friends_only })
    }

    fn request_lobby_data(&mut self, owner: PeerId) -> RequestId {
        self.send(LobbyRequest::LobbyData(owner))
    }

    fn query_server(&mut self, addr: SocketAddr) -> RequestId {
        self.send(LobbyRequest::ServerQuery(addr))
    }

    fn cancel_request(&mut self, request: RequestId) {
        self.directory.lock().requests.push(LobbyRequest::Cancel(request));
        self.outbox.retain(|(id, _)| *id != request);
    }

    fn poll_events(&mut self) -> Vec<PeerLobbyEvent> {
        let state = self.directory.lock();
        if state.unresponsive {
            return Vec::new();
        }

        std::mem::take(&mut self.outbox)
            .into_iter()
            .filter_map(|(request, query)| match query {
                LobbyRequest::LobbyList { .. } => Some(PeerLobbyEvent::LobbyList {
                    request,
                    result: Ok(state.lobbies.clone()),
                }),
                LobbyRequest::LobbyData(owner) => Some(PeerLobbyEvent::Probe {
                    request,
                    result: state
                        .lobbies
                        .iter()
                        .find(|l| l.owner == owner)
                        .cloned()
                        .ok_or(ServiceError::NotFound),
                }),
                LobbyRequest::ServerQuery(addr) => Some(PeerLobbyEvent::Probe {
                    request,
                    result: state.servers.get(&addr).cloned().ok_or(ServiceError::NotFound),
                }),
                LobbyRequest::Cancel(_) => None,
            })
            .collect()
    }
}

// ============================================================================
// Entity-session provider
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    Search(SearchQuery),
    Cancel(RequestId),
    CreateNetwork,
    LeaveNetwork(NetworkId),
    CreateLobby(NetworkId),
    UpdateLobby(LobbyId),
    LeaveLobby(LobbyId),
}

#[derive(Debug)]
enum Queued {
    Search(SearchQuery),
    CreateNetwork,
    CreateLobby(NetworkId, ServerInfo),
    UpdateLobby(LobbyId, ServerInfo),
}

#[derive(Debug, Default)]
struct Client {
    entity: Option<EntityId>,
    outbox: Vec<(RequestId, Queued)>,
    pushed: Vec<EntitySessionEvent>,
    networks: Vec<NetworkId>,
}

#[derive(Debug)]
struct SessionState {
    sessions: Vec<SessionRecord>,
    clients: HashMap<u64, Client>,
    requests: Vec<SessionRequest>,
    next_request: RequestId,
    next_client: u64,
    page_size: usize,
    unresponsive: bool,
    failing_networks: u32,
}

impl SessionState {
    fn handle(&mut self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    fn search(&self, query: &SearchQuery) -> SearchPage {
        let matching: Vec<&SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| match &query.filter {
                SearchFilter::Public {
                    name_contains,
                    network_version,
                } => {
                    (*network_version == 0 || s.info.network_version == *network_version)
                        && name_contains.as_ref().map_or(true, |needle| {
                            s.info.name.to_lowercase().contains(&needle.to_lowercase())
                        })
                }
                SearchFilter::JoinCode(code) => s.info.join_code.as_deref() == Some(code.as_str()),
                SearchFilter::Owner(owner) => &s.owner == owner,
            })
            .collect();

        let offset = query
            .continuation
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        SearchPage {
            records: matching
                .get(offset..end)
                .unwrap_or_default()
                .iter()
                .map(|s| (*s).clone())
                .collect(),
            continuation: (end < matching.len()).then(|| end.to_string()),
        }
    }

    fn answer(&mut self, client: u64, request: RequestId, queued: Queued) -> EntitySessionEvent {
        match queued {
            Queued::Search(query) => EntitySessionEvent::SearchCompleted {
                request,
                result: Ok(self.search(&query)),
            },
            Queued::CreateNetwork => {
                let result = if self.failing_networks > 0 {
                    self.failing_networks -= 1;
                    Err(ServiceError::Failed("network creation refused".to_string()))
                } else {
                    let network = self.handle("net");
                    if let Some(c) = self.clients.get_mut(&client) {
                        c.networks.push(network.clone());
                    }
                    Ok(network)
                };
                EntitySessionEvent::NetworkCreated { request, result }
            }
            Queued::CreateLobby(network, info) => {
                let owner = self.clients.get(&client).and_then(|c| {
                    c.networks
                        .contains(&network)
                        .then(|| c.entity.clone())
                        .flatten()
                });
                let result = match owner {
                    Some(owner) => {
                        let lobby_id = self.handle("lobby");
                        self.sessions.push(SessionRecord {
                            lobby_id: lobby_id.clone(),
                            owner,
                            info,
                        });
                        Ok(lobby_id)
                    }
                    None => Err(ServiceError::NotFound),
                };
                EntitySessionEvent::LobbyCreated { request, result }
            }
            Queued::UpdateLobby(lobby, info) => {
                let result = match self.sessions.iter_mut().find(|s| s.lobby_id == lobby) {
                    Some(session) => {
                        session.info = info;
                        Ok(())
                    }
                    None => Err(ServiceError::NotFound),
                };
                EntitySessionEvent::LobbyUpdated { request, result }
            }
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            clients: HashMap::new(),
            requests: Vec::new(),
            next_request: 0,
            next_client: 0,
            page_size: 50,
            unresponsive: false,
            failing_networks: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
    state: Arc<Mutex<SessionState>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let directory = Self::new();
        directory.lock().page_size = page_size.max(1);
        directory
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session owned by a remote entity.
    pub fn register(&self, owner: EntityId, info: ServerInfo) -> LobbyId {
        let mut state = self.lock();
        let lobby_id = state.handle("lobby");
        state.sessions.push(SessionRecord {
            lobby_id: lobby_id.clone(),
            owner,
            info,
        });
        lobby_id
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        self.lock().requests.clone()
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.lock().unresponsive = !responsive;
    }

    /// The next `count` network creations fail.
    pub fn fail_next_networks(&self, count: u32) {
        self.lock().failing_networks = count;
    }

    /// Drops every live network session, notifying its owner.
    pub fn disconnect_networks(&self, reason: DisconnectReason) {
        let mut state = self.lock();
        for client in state.clients.values_mut() {
            for network in client.networks.drain(..) {
                client
                    .pushed
                    .push(EntitySessionEvent::NetworkDisconnected { network, reason });
            }
        }
    }

    /// A service logged in as `entity`.
    pub fn connect(&self, entity: &str) -> MemorySessionService {
        self.attach(Some(EntityId::new(entity)))
    }

    pub fn connect_logged_out(&self) -> MemorySessionService {
        self.attach(None)
    }

    fn attach(&self, entity: Option<EntityId>) -> MemorySessionService {
        let mut state = self.lock();
        state.next_client += 1;
        let client = state.next_client;
        state.clients.insert(
            client,
            Client {
                entity: entity.clone(),
                ..Default::default()
            },
        );
        MemorySessionService {
            directory: self.clone(),
            client,
            entity,
        }
    }
}

pub struct MemorySessionService {
    directory: SessionDirectory,
    client: u64,
    entity: Option<EntityId>,
}

impl MemorySessionService {
    fn send(&mut self, logged: SessionRequest, queued: Queued) -> RequestId {
        let mut state = self.directory.lock();
        state.next_request += 1;
        let id = state.next_request;
        state.requests.push(logged);
        if let Some(client) = state.clients.get_mut(&self.client) {
            client.outbox.push((id, queued));
        }
        id
    }
}

impl EntitySessionService for MemorySessionService {
    fn local_entity(&self) -> Option<EntityId> {
        self.entity.clone()
    }

    fn submit_search(&mut self, query: &SearchQuery) -> RequestId {
        self.send(SessionRequest::Search(query.clone()), Queued::Search(query.clone()))
    }

    fn cancel_request(&mut self, request: RequestId) {
        let mut state = self.directory.lock();
        state.requests.push(SessionRequest::Cancel(request));
        if let Some(client) = state.clients.get_mut(&self.client) {
            client.outbox.retain(|(id, _)| *id != request);
        }
    }

    fn create_network(&mut self) -> RequestId {
        self.send(SessionRequest::CreateNetwork, Queued::CreateNetwork)
    }

    fn leave_network(&mut self, network: &NetworkId) {
        let mut state = self.directory.lock();
        state.requests.push(SessionRequest::LeaveNetwork(network.clone()));
        if let Some(client) = state.clients.get_mut(&self.client) {
            client.networks.retain(|n| n != network);
        }
    }

    fn create_lobby(&mut self, network: &NetworkId, info: &ServerInfo) -> RequestId {
        self.send(
            SessionRequest::CreateLobby(network.clone()),
            Queued::CreateLobby(network.clone(), info.clone()),
        )
    }

    fn update_lobby(&mut self, lobby: &LobbyId, info: &ServerInfo) -> RequestId {
        self.send(
            SessionRequest::UpdateLobby(lobby.clone()),
            Queued::UpdateLobby(lobby.clone(), info.clone()),
        )
    }

    fn leave_lobby(&mut self, lobby: &LobbyId) {
        let mut state = self.directory.lock();
        state.requests.push(SessionRequest::LeaveLobby(lobby.clone()));
        state.sessions.retain(|s| &s.lobby_id != lobby);
    }

    fn poll_events(&mut self) -> Vec<EntitySessionEvent> {
        let mut state = self.directory.lock();
        let unresponsive = state.unresponsive;
        let (mut events, outbox) = match state.clients.get_mut(&self.client) {
            Some(client) => {
                let pushed = std::mem::take(&mut client.pushed);
                let outbox = if unresponsive {
                    Vec::new()
                } else {
                    std::mem::take(&mut client.outbox)
                };
                (pushed, outbox)
            }
            None => return Vec::new(),
        };

        for (request, queued) in outbox {
            let event = state.answer(self.client, request, queued);
            events.push(event);
        }
        events
    }
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Debug, Default)]
struct ResolverState {
    hosts: HashMap<String, Vec<IpAddr>>,
    queued: Vec<String>,
    lookups: Vec<String>,
}

/// A resolver answering from a fixed host table on the next poll.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    state: Arc<Mutex<ResolverState>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, ip: IpAddr) -> Self {
        self.insert(host, ip);
        self
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        self.lock()
            .hosts
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(ip);
    }

    /// Hosts looked up so far, in order.
    pub fn lookups(&self) -> Vec<String> {
        self.lock().lookups.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostResolver for StaticResolver {
    fn begin(&mut self, host: &str) {
        let mut state = self.lock();
        state.lookups.push(host.to_string());
        state.queued.push(host.to_string());
    }

    fn poll(&mut self) -> Vec<LookupResult> {
        let mut state = self.lock();
        let queued = std::mem::take(&mut state.queued);
        queued
            .into_iter()
            .map(|host| {
                let addresses = state.hosts.get(&host.to_ascii_lowercase()).cloned();
                (host, addresses)
            })
            .collect()
    }
}
