//! Error types for discovery, persistence and admission.

use std::io::Error as IoError;
use std::path::PathBuf;
use thiserror::Error;

/// Terminal outcomes of a connection handshake.
///
/// Every variant has a stable one-byte wire code so the peer can report the
/// exact reason instead of free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HandshakeError {
    #[error("incompatible protocol version")]
    VersionMismatch,

    #[error("could not connect to the server")]
    ConnectFailed,

    #[error("disconnected")]
    Disconnected,

    #[error("wrong password")]
    WrongPassword,

    #[error("already connected from another session")]
    AlreadyConnected,

    #[error("banned from this server")]
    Banned,

    #[error("not on the server allow list")]
    NotAllowlisted,

    #[error("server is full")]
    ServerFull,

    #[error("server does not accept players from this platform")]
    PlatformExcluded,

    #[error("crossplay is not permitted for this account")]
    CrossplayPrivilegeDenied,

    #[error("kicked from the server")]
    Kicked,

    #[error("session ticket could not be verified")]
    InvalidSessionTicket,
}

impl HandshakeError {
    pub const ALL: [HandshakeError; 12] = [
        HandshakeError::VersionMismatch,
        HandshakeError::ConnectFailed,
        HandshakeError::Disconnected,
        HandshakeError::WrongPassword,
        HandshakeError::AlreadyConnected,
        HandshakeError::Banned,
        HandshakeError::NotAllowlisted,
        HandshakeError::ServerFull,
        HandshakeError::PlatformExcluded,
        HandshakeError::CrossplayPrivilegeDenied,
        HandshakeError::Kicked,
        HandshakeError::InvalidSessionTicket,
    ];

    pub fn code(&self) -> u8 {
        match self {
            HandshakeError::VersionMismatch => 1,
            HandshakeError::ConnectFailed => 2,
            HandshakeError::Disconnected => 3,
            HandshakeError::WrongPassword => 4,
            HandshakeError::AlreadyConnected => 5,
            HandshakeError::Banned => 6,
            HandshakeError::NotAllowlisted => 7,
            HandshakeError::ServerFull => 8,
            HandshakeError::PlatformExcluded => 9,
            HandshakeError::CrossplayPrivilegeDenied => 10,
            HandshakeError::Kicked => 11,
            HandshakeError::InvalidSessionTicket => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }
}

/// Failures reported by an external session provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    #[error("request timed out")]
    TimedOut,

    #[error("provider request failed: {0}")]
    Failed(String),
}

/// Discovery and registration conditions.
///
/// Most of these are absorbed inside the backends and surface to callers
/// only as "no data yet"; the ones that reach a caller tell it whether to
/// wait, retry or give up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchmakingError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rate limited, retry later")]
    RateLimited,

    #[error("join code {0} collided too many times")]
    LobbyCollision(String),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("network session lost")]
    NetworkLost,

    #[error("request timed out")]
    Timeout,

    #[error("service error: {0}")]
    Service(ServiceError),
}

impl From<ServiceError> for MatchmakingError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::TimedOut => MatchmakingError::Timeout,
            other => MatchmakingError::Service(other),
        }
    }
}

/// Server list persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to write to file {0}: {1}")]
    FileWrite(PathBuf, IoError),

    #[error("Failed to rename file from {0} to {1}: {2}")]
    FileRename(PathBuf, PathBuf, IoError),

    #[error("Failed to get metadata for file {0}: {1}")]
    FileMetadata(PathBuf, IoError),

    #[error("Unsupported list version {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown backend kind '{0}'")]
    UnknownBackendKind(String),

    #[error("Storage quota exceeded for {location}: need {needed} bytes, {available} available")]
    QuotaExceeded {
        location: String,
        needed: u64,
        available: u64,
    },
}

impl From<&StorageError> for MatchmakingError {
    fn from(e: &StorageError) -> Self {
        match e {
            StorageError::QuotaExceeded { .. } => MatchmakingError::QuotaExceeded,
            other => MatchmakingError::Service(ServiceError::Failed(other.to_string())),
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{0}")]
    Invalid(String),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;
pub type MatchmakingResult<T> = Result<T, MatchmakingError>;
pub type StorageResult<T> = Result<T, StorageError>;
