//! Hostname resolution for dedicated join targets.
//!
//! [`DnsCache`] answers synchronous callers from memory only and starts
//! asynchronous lookups on request; completed lookups are collected on
//! `tick`. A host that resolves to nothing usable is cached as a terminal
//! state rather than reported as an error.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLookup {
    NotQueried,
    Pending,
    Resolved(IpAddr),
    /// Resolved, but only to addresses that cannot be connected to
    Unroutable,
    Unresolvable,
}

impl HostLookup {
    pub fn address(&self) -> Option<IpAddr> {
        match self {
            HostLookup::Resolved(ip) => Some(*ip),
            _ => None,
        }
    }

    /// True once no further answer is expected.
    pub fn is_settled(&self) -> bool {
        !matches!(self, HostLookup::NotQueried | HostLookup::Pending)
    }
}

pub type LookupResult = (String, Option<Vec<IpAddr>>);

/// Asynchronous resolver backend.
pub trait HostResolver: Send {
    fn begin(&mut self, host: &str);

    /// Lookups completed since the last poll; `None` when the host did not resolve.
    fn poll(&mut self) -> Vec<LookupResult>;
}

/// Resolves through the system resolver on a tokio runtime.
pub struct TokioResolver {
    handle: Handle,
    tx: UnboundedSender<LookupResult>,
    rx: UnboundedReceiver<LookupResult>,
}

impl TokioResolver {
    pub fn new(handle: Handle) -> Self {
        let (tx, rx) = unbounded_channel();
        Self { handle, tx, rx }
    }

    /// A resolver on the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl HostResolver for TokioResolver {
    fn begin(&mut self, host: &str) {
        let tx = self.tx.clone();
        let host = host.to_string();
        self.handle.spawn(async move {
            let result = tokio::net::lookup_host((host.as_str(), 0u16))
                .await
                .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>())
                .ok();
            let _ = tx.send((host, result));
        });
    }

    fn poll(&mut self) -> Vec<LookupResult> {
        let mut done = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            done.push(result);
        }
        done
    }
}

/// Whether a remote player could reach `ip` over the public internet.
///
/// Loopback, private, link-local and shared (carrier-grade NAT) ranges are
/// excluded along with their IPv6 counterparts. Documentation ranges are
/// treated as public.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_routable_v4(&v4),
            None => is_routable_v6(v6),
        },
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let this_network = a == 0;
    let shared = a == 100 && (b & 0xc0) == 64;
    !(this_network
        || shared
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || unique_local || link_local)
}

/// Prefers the first routable IPv4 address, then any routable address.
fn classify(addresses: &[IpAddr]) -> HostLookup {
    let routable: Vec<&IpAddr> = addresses.iter().filter(|ip| is_routable(ip)).collect();
    if let Some(v4) = routable.iter().find(|ip| ip.is_ipv4()) {
        return HostLookup::Resolved(**v4);
    }
    match routable.first() {
        Some(ip) => HostLookup::Resolved(**ip),
        None if addresses.is_empty() => HostLookup::Unresolvable,
        None => HostLookup::Unroutable,
    }
}

pub(crate) fn normalize(host: &str) -> String {
    host.trim().trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase()
}

pub struct DnsCache {
    resolver: Box<dyn HostResolver>,
    entries: HashMap<String, HostLookup>,
}

impl DnsCache {
    pub fn new(resolver: Box<dyn HostResolver>) -> Self {
        Self {
            resolver,
            entries: HashMap::new(),
        }
    }

    /// Answers from memory only. Literal addresses never need a lookup.
    pub fn lookup_cached(&self, host: &str) -> HostLookup {
        let host = normalize(host);
        if let Ok(ip) = host.parse::<IpAddr>() {
            return classify(&[ip]);
        }
        self.entries.get(&host).copied().unwrap_or(HostLookup::NotQueried)
    }

    /// Like [`lookup_cached`](Self::lookup_cached), but starts a lookup for
    /// hosts never queried before.
    pub fn resolve(&mut self, host: &str) -> HostLookup {
        let cached = self.lookup_cached(host);
        if cached != HostLookup::NotQueried {
            return cached;
        }
        let host = normalize(host);
        debug!(host = %host, "Starting DNS lookup");
        self.resolver.begin(&host);
        self.entries.insert(host, HostLookup::Pending);
        HostLookup::Pending
    }

    /// Forgets a settled answer and queries again.
    pub fn refresh(&mut self, host: &str) -> HostLookup {
        let key = normalize(host);
        if self.entries.get(&key).is_some_and(HostLookup::is_settled) {
            self.entries.remove(&key);
        }
        self.resolve(host)
    }

    /// Collects finished lookups and returns the hosts they settled.
    pub fn tick(&mut self) -> Vec<(String, HostLookup)> {
        let mut settled = Vec::new();
        for (host, addresses) in self.resolver.poll() {
            let host = normalize(&host);
            let lookup = match addresses {
                Some(addresses) => classify(&addresses),
                None => HostLookup::Unresolvable,
            };
            info!(host = %host, ?lookup, "DNS lookup finished");
            self.entries.insert(host.clone(), lookup);
            settled.push((host, lookup));
        }
        settled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
