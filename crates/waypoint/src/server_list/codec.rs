//! Binary list format.
//!
//! ```text
//! [u32 version][i32 count] { [string kind][string name] <fields> }*
//! ```
//!
//! Integers are little-endian; strings are a `u32` byte length followed by
//! UTF-8. Variant fields: `PeerUser` is `[u64 id]`, `EntitySessionUser` is
//! `[string id]`, `Dedicated` is `[u32 ipv4][u16 port]` in version 0 and
//! `[string host][u16 port]` from version 1 on.

use crate::error::{StorageError, StorageResult};
use crate::types::{BackendKind, EntityId, JoinDescriptor, PeerId, ServerListEntry};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use tracing::warn;

pub const LIST_VERSION: u32 = 1;

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Encodes `entries` in the current version.
pub fn encode(entries: &[ServerListEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&LIST_VERSION.to_le_bytes());
    out.extend_from_slice(&(entries.len() as i32).to_le_bytes());

    for entry in entries {
        put_string(&mut out, entry.descriptor.kind().as_str());
        put_string(&mut out, &entry.name);
        match &entry.descriptor {
            JoinDescriptor::PeerUser { peer_id } => out.extend_from_slice(&peer_id.0.to_le_bytes()),
            JoinDescriptor::EntitySessionUser { remote_entity_id } => {
                put_string(&mut out, remote_entity_id.as_str())
            }
            JoinDescriptor::Dedicated { host, port } => {
                put_string(&mut out, host);
                out.extend_from_slice(&port.to_le_bytes());
            }
        }
    }
    out
}

/// Decodes a list payload. Entries get `captured_at` as their name timestamp.
///
/// An unknown version or backend kind fails the whole payload. A payload cut
/// short keeps the entries read before the cut.
pub fn decode(bytes: &[u8], captured_at: DateTime<Utc>) -> StorageResult<Vec<ServerListEntry>> {
    let mut reader = Reader { bytes };
    let Some(version) = reader.u32() else {
        return Ok(Vec::new());
    };
    if version > LIST_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }
    let count = reader.i32().unwrap_or(0).max(0) as usize;

    let mut entries = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        match read_entry(&mut reader, version, captured_at)? {
            Some(entry) => entries.push(entry),
            None => {
                warn!("List payload truncated at entry {} of {}", index, count);
                break;
            }
        }
    }
    Ok(entries)
}

fn read_entry(
    reader: &mut Reader<'_>,
    version: u32,
    captured_at: DateTime<Utc>,
) -> StorageResult<Option<ServerListEntry>> {
    let Some(kind) = reader.string() else {
        return Ok(None);
    };
    let kind: BackendKind = kind.parse().map_err(|_| StorageError::UnknownBackendKind(kind))?;
    let Some(name) = reader.string() else {
        return Ok(None);
    };

    let descriptor = match kind {
        BackendKind::PeerUser => reader.u64().map(|id| JoinDescriptor::PeerUser { peer_id: PeerId(id) }),
        BackendKind::EntitySessionUser => reader.string().map(|id| JoinDescriptor::EntitySessionUser {
            remote_entity_id: EntityId::new(id),
        }),
        BackendKind::Dedicated if version == 0 => {
            let ip = reader.u32().map(Ipv4Addr::from);
            let port = reader.u16();
            ip.zip(port)
                .map(|(ip, port)| JoinDescriptor::dedicated(ip.to_string(), port))
        }
        BackendKind::Dedicated => {
            let host = reader.string();
            let port = reader.u16();
            host.zip(port).map(|(host, port)| JoinDescriptor::dedicated(host, port))
        }
    };

    Ok(descriptor.map(|descriptor| ServerListEntry::new(descriptor, name, captured_at)))
}
