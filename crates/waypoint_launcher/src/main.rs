//! Waypoint launcher.
//!
//! Loads configuration, opens the favorites and recent lists, then drives
//! the matchmaking dispatcher from a fixed-rate tick loop until a shutdown
//! signal arrives. Session providers are the in-process directories from
//! `waypoint::memory`, so the launcher runs without any provider SDK.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use waypoint::backend::{EntitySessionBackend, PeerLobbyBackend};
use waypoint::clock::system_clock;
use waypoint::dns::{DnsCache, HostResolver, TokioResolver};
use waypoint::memory::{LobbyDirectory, SessionDirectory, StaticResolver};
use waypoint::public_ip::PublicIpLookup;
use waypoint::registration::HostSettings;
use waypoint::server_list::{FileStorage, ServerList};
use waypoint::{
    BackendKind, CachedServerEntry, JoinDescriptor, MatchmakingDispatcher, MatchmakingEvent,
    MatchmakingBackend, RefreshFlags, ServerListEntry, SessionDescriptor,
};

use crate::cli::Args;
use crate::config::AppConfig;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Results delivered by dispatcher callbacks, handled on the tick loop.
enum LauncherEvent {
    JoinCodeResolved(String, Option<CachedServerEntry>),
    ServerAnswered(JoinDescriptor, SessionDescriptor),
    AddressResolved(JoinDescriptor, Option<SocketAddr>),
}

pub struct Application {
    args: Args,
    config: AppConfig,
    dispatcher: MatchmakingDispatcher,
    favorites: ServerList,
    recent: ServerList,
    events_tx: UnboundedSender<LauncherEvent>,
    events_rx: UnboundedReceiver<LauncherEvent>,
    // Kept alive for the lifetime of the in-process providers
    _lobbies: LobbyDirectory,
    _sessions: SessionDirectory,
}

impl Application {
    pub async fn new(args: Args) -> Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config)
            .await
            .map_err(|e| anyhow!("Failed to load {}: {e}", args.config.display()))?;
        config.apply_args(&args);
        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;

        let clock = system_clock();
        let lobbies = LobbyDirectory::new();
        let sessions = SessionDirectory::new();

        let peer = PeerLobbyBackend::new(
            Box::new(lobbies.connect()),
            config.matchmaking.clone(),
            clock.clone(),
        );
        let mut entity = EntitySessionBackend::new(
            Box::new(sessions.connect(&format!("launcher-{}", args.instance))),
            config.matchmaking.clone(),
            clock.clone(),
        );
        if args.host {
            if let Some(endpoint) = &config.host.public_ip_endpoint {
                entity = entity.with_public_ip(PublicIpLookup::spawn(
                    endpoint.clone(),
                    config.host.public_ip_path.clone(),
                    Duration::from_millis(config.host.public_ip_timeout_ms),
                ));
            }
        }

        let resolver: Box<dyn HostResolver> = match TokioResolver::current() {
            Some(resolver) => Box::new(resolver),
            None => {
                warn!("No async runtime for DNS; hostnames will not resolve");
                Box::new(StaticResolver::new())
            }
        };
        let dispatcher = MatchmakingDispatcher::new(peer, entity, DnsCache::new(resolver), clock);

        let favorites = open_list(&config, &args.instance, "favorites", config.lists.favorites_max_entries);
        let recent = open_list(&config, &args.instance, "recent", config.lists.recent_max_entries);

        info!("📂 Config: {} | Instance: {}", args.config.display(), args.instance);
        info!(
            "📋 Lists: {} favorites, {} recent",
            favorites.len(),
            recent.len()
        );

        let (events_tx, events_rx) = unbounded_channel();
        Ok(Self {
            args,
            config,
            dispatcher,
            favorites,
            recent,
            events_tx,
            events_rx,
            _lobbies: lobbies,
            _sessions: sessions,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut notifications = self.dispatcher.subscribe();
        self.start()?;

        info!("✅ Waypoint launcher is running");
        info!("🛑 Press Ctrl+C to shut down");

        let shutdown = signals::wait_for_shutdown();
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut last_tick = Instant::now();
        let mut since_list_refresh = Duration::ZERO;

        let reason = loop {
            tokio::select! {
                result = &mut shutdown => {
                    break match result {
                        Ok(signal) => format!("received {signal}"),
                        Err(e) => {
                            error!("❌ Signal handling failed: {:#}", e);
                            "signal handling failed".to_string()
                        }
                    };
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    let dt = now - last_tick;
                    last_tick = now;

                    since_list_refresh += dt;
                    if since_list_refresh >= LIST_REFRESH_INTERVAL {
                        since_list_refresh = Duration::ZERO;
                        self.refresh_lists();
                    }

                    self.dispatcher.tick(dt);
                    self.drain_notifications(&mut notifications);
                    self.drain_events();
                }
            }
        };

        self.shutdown(&reason);
        Ok(())
    }

    /// Kicks off everything the command line asked for.
    fn start(&mut self) -> Result<()> {
        if self.args.host {
            let mut settings = HostSettings::new(self.config.session_name(&self.args.instance), &self.config.matchmaking);
            settings.max_players = self.config.host.max_players;
            settings.password_protected = self.config.host.password.is_some();
            settings.port = self.config.host.port;
            self.dispatcher
                .entity_session_mut()
                .start_hosting(settings)
                .context("Failed to start hosting")?;
        }

        if let Some(code) = self.args.join_code.clone() {
            let tx = self.events_tx.clone();
            let reported = code.clone();
            self.dispatcher
                .entity_session_mut()
                .find_by_join_code(
                    &code,
                    Box::new(move |entry| {
                        let _ = tx.send(LauncherEvent::JoinCodeResolved(reported, entry));
                    }),
                )
                .context("Join-code search failed")?;
            info!("🔎 Looking up join code {}", code);
        }

        if let Some(address) = self.args.connect.clone() {
            let target: JoinDescriptor = address.parse().map_err(|e| anyhow!("Bad --connect address: {e}"))?;
            self.probe(target);
        }

        self.refresh_lists();
        Ok(())
    }

    fn probe(&mut self, target: JoinDescriptor) {
        let tx = self.events_tx.clone();
        let answered = target.clone();
        let status = self.dispatcher.ping(
            &target,
            Box::new(move |snapshot| {
                let _ = tx.send(LauncherEvent::ServerAnswered(answered, snapshot.clone()));
            }),
        );
        info!("🔎 Probing {} ({:?})", target, status);

        if matches!(target, JoinDescriptor::Dedicated { .. }) {
            let tx = self.events_tx.clone();
            let resolved = target.clone();
            self.dispatcher.get_server_ip_async(
                &target,
                Box::new(move |addr| {
                    let _ = tx.send(LauncherEvent::AddressResolved(resolved, addr));
                }),
            );
        }
    }

    fn refresh_lists(&mut self) {
        for kind in [BackendKind::PeerUser, BackendKind::EntitySessionUser] {
            if !self.dispatcher.backend(kind).can_refresh_now() {
                continue;
            }
            if let Err(e) = self.dispatcher.refresh(kind, RefreshFlags::default()) {
                warn!("Could not refresh {} list: {}", kind, e);
            }
        }
    }

    fn drain_notifications(&mut self, notifications: &mut tokio::sync::broadcast::Receiver<MatchmakingEvent>) {
        loop {
            match notifications.try_recv() {
                Ok(MatchmakingEvent::ListUpdated(kind)) => {
                    let list = self.dispatcher.public_list(kind);
                    info!("📋 {} list updated: {} servers", kind, list.len());
                    for entry in list.iter().take(10) {
                        info!("  - {} ({})", entry.name().unwrap_or("?"), entry.descriptor);
                    }
                }
                Ok(MatchmakingEvent::ServerUpdated(descriptor)) => {
                    let known = self.dispatcher.cached_data(&descriptor, chrono::DateTime::<Utc>::MIN_UTC);
                    if let Some(snapshot) = known {
                        rename_from_snapshot(&mut self.favorites, &descriptor, &snapshot);
                        rename_from_snapshot(&mut self.recent, &descriptor, &snapshot);
                    }
                }
                Ok(MatchmakingEvent::HostResolved { .. }) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Dropped {} matchmaking notifications", skipped);
                }
                Err(_) => break,
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LauncherEvent::JoinCodeResolved(code, Some(entry)) => {
                    info!("🔗 Join code {} belongs to {}", code, entry.descriptor);
                    let name = entry.name().unwrap_or_default().to_string();
                    self.joined(entry.descriptor, name);
                }
                LauncherEvent::JoinCodeResolved(code, None) => {
                    warn!("🚫 No session advertises join code {}", code);
                }
                LauncherEvent::ServerAnswered(target, snapshot) => match snapshot.info {
                    Some(info) => {
                        info!(
                            "✅ {} answered: '{}' {}/{} players",
                            target, info.name, info.player_count, info.max_players
                        );
                        self.joined(target, info.name);
                    }
                    None => warn!("🚫 {} did not answer", target),
                },
                LauncherEvent::AddressResolved(target, Some(addr)) => {
                    info!("🌐 {} connects to {}", target, addr);
                }
                LauncherEvent::AddressResolved(target, None) => {
                    warn!("🌐 {} has no routable address", target);
                }
            }
        }
    }

    fn joined(&mut self, descriptor: JoinDescriptor, name: String) {
        match self.dispatcher.resolve_join_target(&descriptor) {
            Some(target) => info!("🔗 Joining {} via {:?}", descriptor, target),
            None => info!("🔗 Joining {}", descriptor),
        }
        self.recent
            .add_to_beginning(ServerListEntry::new(descriptor, name, Utc::now()));
    }

    fn shutdown(mut self, reason: &str) {
        info!("🛑 Shutting down ({})...", reason);
        self.dispatcher.entity_session_mut().stop_hosting();

        for list in [&mut self.favorites, &mut self.recent] {
            if let Err(e) = list.flush() {
                error!("❌ Failed to save {} list: {}", list.name(), e);
            }
        }
        info!("👋 Waypoint launcher stopped");
    }
}

/// Renames a saved entry after the server's advertised name, dated by when
/// the snapshot was captured so an older answer never overwrites a newer name.
fn rename_from_snapshot(list: &mut ServerList, descriptor: &JoinDescriptor, snapshot: &SessionDescriptor) -> bool {
    match snapshot.info.as_ref() {
        Some(info) => list.update_name(descriptor, &info.name, snapshot.captured_at),
        None => false,
    }
}

/// Opens `name` under the instance's local directory plus the cloud
/// directory when one is configured, and loads whatever is stored there.
fn open_list(config: &AppConfig, instance: &str, name: &str, max_entries: usize) -> ServerList {
    let mut list = ServerList::new(name)
        .with_max_entries(max_entries)
        .with_location(Box::new(FileStorage::local(config.local_list_dir(instance))));
    if let Some(dir) = config.cloud_list_dir(instance) {
        list = list.with_location(Box::new(FileStorage::cloud(dir, config.lists.cloud_quota_bytes)));
    }
    list.load();
    list
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint::ServerInfo;

    fn snapshot(name: &str, captured_at: chrono::DateTime<Utc>) -> SessionDescriptor {
        SessionDescriptor::new(
            ServerInfo {
                name: name.to_string(),
                ..Default::default()
            },
            captured_at,
        )
    }

    #[test]
    fn test_rename_uses_capture_time() {
        let saved_at = Utc::now();
        let target = JoinDescriptor::peer(7);
        let mut list = ServerList::new("favorites");
        list.add(ServerListEntry::new(target.clone(), "Original", saved_at));

        let stale = snapshot("Stale", saved_at - chrono::Duration::seconds(30));
        assert!(!rename_from_snapshot(&mut list, &target, &stale));
        assert_eq!(list.entries()[0].name, "Original");

        let fresh_at = saved_at + chrono::Duration::seconds(5);
        assert!(rename_from_snapshot(&mut list, &target, &snapshot("Renamed", fresh_at)));
        assert_eq!(list.entries()[0].name, "Renamed");
        assert_eq!(list.entries()[0].name_captured_at, fresh_at);

        assert!(!rename_from_snapshot(&mut list, &target, &SessionDescriptor::none(fresh_at + chrono::Duration::seconds(1))));
    }
}
