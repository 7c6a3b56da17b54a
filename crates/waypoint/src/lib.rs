//! # Waypoint
//!
//! Server discovery, matchmaking and connection admission for multiplayer
//! game sessions.
//!
//! The crate covers four concerns:
//! - Discovering servers across two heterogeneous session providers
//!   (a peer-lobby provider and an entity-session provider) behind one
//!   [`backend::MatchmakingBackend`] contract
//! - Merging, caching and resolving join targets through the
//!   [`dispatcher::MatchmakingDispatcher`], including DNS for dedicated hosts
//! - Persisting favorites and recent servers in [`server_list::ServerList`]
//!   across several storage locations
//! - Running the post-connect [`handshake`] on both sides of a connection
//!
//! Nothing here blocks or spawns threads on its own (the public IP lookup
//! worker is the one exception). Every component is a state machine owned by
//! a single caller and advanced with `tick(dt)` from the caller's loop.

pub mod backend;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod public_ip;
pub mod registration;
pub mod server_list;
pub mod types;

pub use backend::{MatchmakingBackend, PingCallback, PingStatus, RefreshFlags};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::MatchmakingConfig;
pub use dispatcher::{MatchmakingDispatcher, MatchmakingEvent};
pub use error::{
    ConfigError, HandshakeError, HandshakeResult, MatchmakingError, MatchmakingResult,
    ServiceError, StorageError, StorageResult,
};
pub use server_list::ServerList;
pub use types::*;
