//! # Connection handshake
//!
//! Runs once a transport connection exists, on both ends:
//!
//! ```text
//! client                                host
//!   | -- Request ----------------------> |
//!   | <-------- Challenge{need_password, salt}
//!   | -- PeerInfo{digest, ticket} -----> |  version, access lists, platform,
//!   |                                    |  ticket, capacity, password, duplicate
//!   | <------------- PeerInfo{world} --- |
//!   | <-- Admitted{players, admins, time}|
//! ```
//!
//! Any failed check answers `Error{code}` instead; the code maps back to a
//! [`HandshakeError`](crate::error::HandshakeError). Neither side retries.
//! Both state machines are transport-agnostic and exchange
//! [`HandshakeMessage`]s the caller carries.

pub mod access;
pub mod client;
pub mod host;
pub mod messages;
pub mod password;

pub use access::{AccessLists, IdentityList};
pub use client::{ClientProfile, ClientState, HandshakeClient};
pub use host::{AdmissionPolicy, HandshakeHost, HostOutcome, HostReply, KeyedTicketVerifier, TicketVerifier};
pub use messages::{HandshakeMessage, HostWorldInfo, PeerInfo, PeerRole, PROTOCOL_VERSION};
