//! Entity-session backend.
//!
//! Discovery is a server-side filtered search. All searches go through one
//! sequential queue: at most one search is in flight, and submissions are
//! spaced by a minimum delay to stay under the provider's rate limits.
//! Join-by-code and join-code uniqueness checks use a priority lane that
//! preempts any in-flight browse or ping search.
//!
//! The backend also owns the hosting [`SessionRegistrar`], feeding it
//! provider events, its join-code searches and the public address.

use super::pending::PendingPings;
use super::service::{
    EntitySessionEvent, EntitySessionService, RequestId, SearchFilter, SearchPage, SearchQuery,
    SessionRecord,
};
use super::{
    connect_target_from, should_replace, ConnectTarget, MatchmakingBackend, PingCallback, PingStatus,
    RefreshFlags,
};
use crate::clock::SharedClock;
use crate::config::MatchmakingConfig;
use crate::error::{MatchmakingError, MatchmakingResult, ServiceError};
use crate::public_ip::PublicIpLookup;
use crate::registration::{HostSettings, RegistrationState, SessionRegistrar};
use crate::types::{BackendKind, CachedServerEntry, EntityId, JoinDescriptor, SessionDescriptor};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives the session advertising a join code, or `None`.
pub type JoinCodeCallback = Box<dyn FnOnce(Option<CachedServerEntry>) + Send>;

enum SearchPurpose {
    PublicList,
    Ping(EntityId),
    JoinCode(String, JoinCodeCallback),
    Uniqueness,
}

impl SearchPurpose {
    fn label(&self) -> &'static str {
        match self {
            SearchPurpose::PublicList => "public list",
            SearchPurpose::Ping(_) => "ping",
            SearchPurpose::JoinCode(..) => "join code",
            SearchPurpose::Uniqueness => "join-code uniqueness",
        }
    }
}

struct QueuedSearch {
    purpose: SearchPurpose,
    query: SearchQuery,
    pages: u32,
    records: Vec<SessionRecord>,
}

impl QueuedSearch {
    fn new(purpose: SearchPurpose, filter: SearchFilter) -> Self {
        Self {
            purpose,
            query: SearchQuery::new(filter),
            pages: 0,
            records: Vec::new(),
        }
    }

    /// Drops fetched pages so the search starts over from the first page.
    fn restart(&mut self) {
        self.query.continuation = None;
        self.pages = 0;
        self.records.clear();
    }
}

struct InFlight {
    request: RequestId,
    search: QueuedSearch,
    priority: bool,
    elapsed: Duration,
}

/// Sequential submission queue with a priority lane.
struct SearchQueue {
    normal: VecDeque<QueuedSearch>,
    priority: VecDeque<QueuedSearch>,
    in_flight: Option<InFlight>,
    since_submit: Option<Duration>,
    spacing: Duration,
}

impl SearchQueue {
    fn new(spacing: Duration) -> Self {
        Self {
            normal: VecDeque::new(),
            priority: VecDeque::new(),
            in_flight: None,
            since_submit: None,
            spacing,
        }
    }

    fn push(&mut self, search: QueuedSearch) {
        self.normal.push_back(search);
    }

    /// Queues a priority search. An in-flight normal search is preempted and
    /// requeued at the front; its request id is returned for cancellation.
    fn push_priority(&mut self, search: QueuedSearch) -> Option<RequestId> {
        self.priority.push_back(search);
        match self.in_flight.take() {
            Some(in_flight) if !in_flight.priority => {
                let mut preempted = in_flight.search;
                preempted.restart();
                self.normal.push_front(preempted);
                Some(in_flight.request)
            }
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    /// Continues a paginated search ahead of everything else in its lane.
    fn push_front(&mut self, search: QueuedSearch, priority: bool) {
        if priority {
            self.priority.push_front(search);
        } else {
            self.normal.push_front(search);
        }
    }

    /// Removes matching searches; returns the in-flight request if it matched.
    fn remove_where(&mut self, mut matches: impl FnMut(&SearchPurpose) -> bool) -> Option<RequestId> {
        self.normal.retain(|s| !matches(&s.purpose));
        self.priority.retain(|s| !matches(&s.purpose));
        match self.in_flight.take() {
            Some(in_flight) if matches(&in_flight.search.purpose) => Some(in_flight.request),
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    fn any(&self, mut matches: impl FnMut(&SearchPurpose) -> bool) -> bool {
        self.normal.iter().any(|s| matches(&s.purpose))
            || self.priority.iter().any(|s| matches(&s.purpose))
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| matches(&f.search.purpose))
    }

    fn advance(&mut self, dt: Duration) {
        if let Some(since) = self.since_submit.as_mut() {
            *since += dt;
        }
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.elapsed += dt;
        }
    }

    fn pop_ready(&mut self) -> Option<(QueuedSearch, bool)> {
        if self.in_flight.is_some() || self.since_submit.is_some_and(|s| s < self.spacing) {
            return None;
        }
        if let Some(search) = self.priority.pop_front() {
            return Some((search, true));
        }
        self.normal.pop_front().map(|search| (search, false))
    }

    fn submitted(&mut self, request: RequestId, search: QueuedSearch, priority: bool) {
        self.in_flight = Some(InFlight {
            request,
            search,
            priority,
            elapsed: Duration::ZERO,
        });
        self.since_submit = Some(Duration::ZERO);
    }

    fn take_completed(&mut self, request: RequestId) -> Option<InFlight> {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.request == request => Some(in_flight),
            other => {
                self.in_flight = other;
                None
            }
        }
    }

    fn take_timed_out(&mut self, timeout: Duration) -> Option<InFlight> {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.elapsed >= timeout => Some(in_flight),
            other => {
                self.in_flight = other;
                None
            }
        }
    }
}

pub struct EntitySessionBackend {
    service: Box<dyn EntitySessionService>,
    config: MatchmakingConfig,
    clock: SharedClock,
    flags: RefreshFlags,
    filter: String,
    queue: SearchQueue,
    since_refresh: Option<Duration>,
    public_list: Vec<CachedServerEntry>,
    revision: u64,
    pings: PendingPings<EntityId>,
    cache: HashMap<EntityId, SessionDescriptor>,
    registrar: Option<SessionRegistrar>,
    public_ip: Option<PublicIpLookup>,
}

impl EntitySessionBackend {
    pub fn new(service: Box<dyn EntitySessionService>, config: MatchmakingConfig, clock: SharedClock) -> Self {
        let queue = SearchQueue::new(config.search_submit_spacing());
        let pings = PendingPings::new(config.ping_timeout(), config.refresh_interval());
        Self {
            service,
            config,
            clock,
            flags: RefreshFlags::default(),
            filter: String::new(),
            queue,
            since_refresh: None,
            public_list: Vec::new(),
            revision: 0,
            pings,
            cache: HashMap::new(),
            registrar: None,
            public_ip: None,
        }
    }

    /// Address lookup whose result is published by the hosted session.
    pub fn with_public_ip(mut self, lookup: PublicIpLookup) -> Self {
        self.public_ip = Some(lookup);
        self
    }

    pub fn local_entity(&self) -> Option<EntityId> {
        self.service.local_entity()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    /// Searches for the session advertising `code` through the priority lane.
    pub fn find_by_join_code(&mut self, code: &str, callback: JoinCodeCallback) -> MatchmakingResult<()> {
        self.ensure_logged_in()?;
        let code = code.trim().to_string();
        let search = QueuedSearch::new(
            SearchPurpose::JoinCode(code.clone(), callback),
            SearchFilter::JoinCode(code.clone()),
        );
        self.push_priority(search);
        debug!(code = %code, "Join-code search queued");
        Ok(())
    }

    pub fn start_hosting(&mut self, settings: HostSettings) -> MatchmakingResult<()> {
        let registrar = SessionRegistrar::new(settings, self.config.clone());
        self.start_hosting_with(registrar)
    }

    /// Hosts with a preconfigured registrar, e.g. one with a custom code source.
    pub fn start_hosting_with(&mut self, mut registrar: SessionRegistrar) -> MatchmakingResult<()> {
        self.ensure_logged_in()?;
        self.stop_hosting();
        info!("🚀 Registering hosted session '{}'", registrar.settings().name);
        registrar.start(self.service.as_mut());
        self.registrar = Some(registrar);
        Ok(())
    }

    pub fn stop_hosting(&mut self) {
        if let Some(mut registrar) = self.registrar.take() {
            registrar.stop(self.service.as_mut());
            if let Some(request) = self
                .queue
                .remove_where(|p| matches!(p, SearchPurpose::Uniqueness))
            {
                self.service.cancel_request(request);
            }
            info!("Hosted session unregistered");
        }
    }

    pub fn registration_state(&self) -> Option<&RegistrationState> {
        self.registrar.as_ref().map(SessionRegistrar::state)
    }

    pub fn registrar(&self) -> Option<&SessionRegistrar> {
        self.registrar.as_ref()
    }

    pub fn registrar_mut(&mut self) -> Option<&mut SessionRegistrar> {
        self.registrar.as_mut()
    }

    fn ensure_logged_in(&self) -> MatchmakingResult<()> {
        match self.service.local_entity() {
            Some(_) => Ok(()),
            None => Err(MatchmakingError::BackendUnavailable(
                "entity-session provider is not logged in".to_string(),
            )),
        }
    }

    fn push_priority(&mut self, search: QueuedSearch) {
        if let Some(request) = self.queue.push_priority(search) {
            debug!(request, "Priority search preempted in-flight search");
            self.service.cancel_request(request);
        }
    }

    fn entity_of(target: &JoinDescriptor) -> &EntityId {
        match target {
            JoinDescriptor::EntitySessionUser { remote_entity_id } => remote_entity_id,
            other => panic!("entity-session backend cannot serve descriptor {other}"),
        }
    }

    fn public_filter(&self) -> SearchFilter {
        SearchFilter::Public {
            name_contains: (!self.filter.is_empty()).then(|| self.filter.clone()),
            network_version: if self.flags.compatible_only {
                self.config.network_version
            } else {
                0
            },
        }
    }

    fn restart_public_search(&mut self) {
        self.cancel_refresh();
        let search = QueuedSearch::new(SearchPurpose::PublicList, self.public_filter());
        self.queue.push(search);
        self.since_refresh = Some(Duration::ZERO);
    }

    fn store(&mut self, entity: EntityId, snapshot: SessionDescriptor) {
        if should_replace(self.cache.get(&entity), &snapshot) {
            self.cache.insert(entity, snapshot);
        }
    }

    fn entry_for(&mut self, record: SessionRecord, now: DateTime<Utc>) -> CachedServerEntry {
        let snapshot = SessionDescriptor::new(record.info, now);
        self.store(record.owner.clone(), snapshot.clone());
        CachedServerEntry::new(
            JoinDescriptor::EntitySessionUser {
                remote_entity_id: record.owner,
            },
            snapshot,
        )
    }

    fn on_search_completed(&mut self, request: RequestId, result: Result<SearchPage, ServiceError>) {
        let Some(in_flight) = self.queue.take_completed(request) else {
            debug!(request, "Ignoring result of a cancelled search");
            return;
        };
        let mut search = in_flight.search;

        match result {
            Ok(page) => {
                search.records.extend(page.records);
                search.pages += 1;
                match page.continuation {
                    Some(token) if search.pages < self.config.search_page_limit => {
                        search.query.continuation = Some(token);
                        self.queue.push_front(search, in_flight.priority);
                    }
                    _ => self.finish_search(search.purpose, Ok(search.records)),
                }
            }
            Err(e) => self.finish_search(search.purpose, Err(e)),
        }
    }

    fn finish_search(&mut self, purpose: SearchPurpose, result: Result<Vec<SessionRecord>, ServiceError>) {
        let now = self.clock.now();
        match purpose {
            SearchPurpose::PublicList => match result {
                Ok(records) => {
                    let list: Vec<CachedServerEntry> =
                        records.into_iter().map(|r| self.entry_for(r, now)).collect();
                    self.public_list = list;
                    self.revision += 1;
                    info!("🔎 Entity-session search complete: {} sessions", self.public_list.len());
                }
                Err(e) => warn!("Entity-session search failed: {}", e),
            },
            SearchPurpose::Ping(entity) => {
                let snapshot = match result {
                    Ok(records) => match records.into_iter().find(|r| r.owner == entity) {
                        Some(record) => self.entry_for(record, now).data,
                        None => SessionDescriptor::none(now),
                    },
                    Err(e) => {
                        debug!(%entity, "Session probe failed: {}", e);
                        SessionDescriptor::none(now)
                    }
                };
                self.store(entity.clone(), snapshot.clone());
                for waiter in self.pings.complete(&entity) {
                    waiter(&snapshot);
                }
            }
            SearchPurpose::JoinCode(code, callback) => {
                let found = match result {
                    Ok(mut records) => {
                        if records.len() > 1 {
                            warn!(code = %code, "{} sessions advertise the same join code", records.len());
                        }
                        (!records.is_empty()).then(|| records.remove(0))
                    }
                    Err(e) => {
                        warn!(code = %code, "Join-code search failed: {}", e);
                        None
                    }
                };
                match found {
                    Some(record) => {
                        let entry = self.entry_for(record, now);
                        info!(code = %code, "Join code resolved to {}", entry.descriptor);
                        callback(Some(entry));
                    }
                    None => callback(None),
                }
            }
            SearchPurpose::Uniqueness => {
                let local = self.service.local_entity();
                if let Some(registrar) = self.registrar.as_mut() {
                    registrar.on_join_code_search(result, local.as_ref(), self.service.as_mut());
                }
            }
        }
    }

    /// Resolves a search that will never complete.
    fn abandon_search(&mut self, search: QueuedSearch) {
        warn!("{} search timed out", search.purpose.label());
        match search.purpose {
            // Pending pings time out on their own.
            SearchPurpose::Ping(_) | SearchPurpose::PublicList => {}
            purpose => self.finish_search(purpose, Err(ServiceError::TimedOut)),
        }
    }

    fn submit_next(&mut self) {
        if let Some((search, priority)) = self.queue.pop_ready() {
            let request = self.service.submit_search(&search.query);
            debug!(
                request,
                purpose = search.purpose.label(),
                page = search.pages + 1,
                "Search submitted"
            );
            self.queue.submitted(request, search, priority);
        }
    }
}

impl MatchmakingBackend for EntitySessionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EntitySessionUser
    }

    fn refresh_public_list(&mut self, flags: RefreshFlags) -> MatchmakingResult<()> {
        self.ensure_logged_in()?;
        if self
            .since_refresh
            .is_some_and(|since| since < self.config.refresh_interval())
        {
            return Err(MatchmakingError::RateLimited);
        }
        if flags.friends_only {
            debug!("Friends-only browse is not supported by the entity-session provider");
        }
        self.flags = flags;
        self.restart_public_search();
        Ok(())
    }

    fn cancel_refresh(&mut self) {
        if let Some(request) = self
            .queue
            .remove_where(|p| matches!(p, SearchPurpose::PublicList))
        {
            self.service.cancel_request(request);
            debug!(request, "Entity-session search cancelled");
        }
    }

    fn set_filter(&mut self, filter: &str) {
        let filter = filter.trim().to_string();
        if filter == self.filter {
            return;
        }
        self.filter = filter;
        // Filtering is server-side, so a previously browsed list is re-fetched.
        if self.since_refresh.is_some() && self.service.local_entity().is_some() {
            self.restart_public_search();
        }
    }

    fn can_refresh_now(&self) -> bool {
        self.service.local_entity().is_some()
            && !self.queue.any(|p| matches!(p, SearchPurpose::PublicList))
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
        let entity = Self::entity_of(target).clone();

        let callback = match self.pings.attach(&entity, callback) {
            Ok(()) => {
                debug!(%entity, "Ping coalesced with pending probe");
                return PingStatus::Coalesced;
            }
            Err(callback) => callback,
        };
        if let Err(e) = self.ensure_logged_in() {
            return PingStatus::Rejected(e);
        }
        if self.pings.is_rate_limited(&entity) || self.pings.len() >= self.config.max_pending_pings {
            debug!(%entity, "Ping rate limited");
            return PingStatus::Rejected(MatchmakingError::RateLimited);
        }

        let search = QueuedSearch::new(
            SearchPurpose::Ping(entity.clone()),
            SearchFilter::Owner(entity.clone()),
        );
        self.queue.push(search);
        self.pings.begin(entity, callback);
        PingStatus::Dispatched
    }

    fn cached_data(&self, target: &JoinDescriptor, newer_than: DateTime<Utc>) -> Option<SessionDescriptor> {
        self.cache
            .get(Self::entity_of(target))
            .filter(|snapshot| snapshot.is_newer_than(newer_than))
            .cloned()
    }

    fn cache_data(&mut self, target: &JoinDescriptor, data: SessionDescriptor) {
        let entity = Self::entity_of(target).clone();
        self.store(entity, data);
    }

    fn resolve_join_target(&self, target: &JoinDescriptor) -> Option<ConnectTarget> {
        let entity = Self::entity_of(target);
        connect_target_from(self.cache.get(entity), ConnectTarget::Entity(entity.clone()))
    }

    fn tick(&mut self, dt: Duration) {
        if let Some(since) = self.since_refresh.as_mut() {
            *since += dt;
        }
        self.queue.advance(dt);

        if let Some(in_flight) = self.queue.take_timed_out(self.config.search_timeout()) {
            self.service.cancel_request(in_flight.request);
            self.abandon_search(in_flight.search);
        }

        if let Some(registrar) = self.registrar.as_mut() {
            if let Some(ip) = self.public_ip.as_ref().and_then(PublicIpLookup::poll) {
                registrar.observe_public_ip(ip);
            }
            registrar.tick(dt, self.service.as_mut());
        }
        self.queue_registrar_search();
        self.submit_next();

        for event in self.service.poll_events() {
            match event {
                EntitySessionEvent::SearchCompleted { request, result } => {
                    self.on_search_completed(request, result)
                }
                other => {
                    let handled = match self.registrar.as_mut() {
                        Some(registrar) => registrar.handle_event(&other, self.service.as_mut()),
                        None => false,
                    };
                    if !handled {
                        debug!(?other, "Unrouted entity-session event");
                    }
                }
            }
        }
        self.queue_registrar_search();

        let expired = self.pings.advance(dt);
        if !expired.is_empty() {
            let now = self.clock.now();
            for (entity, waiters) in expired {
                let target = entity.clone();
                if let Some(request) = self
                    .queue
                    .remove_where(|p| matches!(p, SearchPurpose::Ping(e) if *e == target))
                {
                    self.service.cancel_request(request);
                }
                debug!(%entity, "Ping timed out");
                let unknown = SessionDescriptor::none(now);
                for waiter in waiters {
                    waiter(&unknown);
                }
            }
        }
    }
}

impl EntitySessionBackend {
    fn queue_registrar_search(&mut self) {
        let query = self.registrar.as_mut().and_then(SessionRegistrar::take_search);
        if let Some(query) = query {
            let search = QueuedSearch {
                purpose: SearchPurpose::Uniqueness,
                query,
                pages: 0,
                records: Vec::new(),
            };
            self.push_priority(search);
        }
    }
}
