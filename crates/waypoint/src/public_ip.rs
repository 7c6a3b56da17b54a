//! Public address discovery.
//!
//! The lookup is a blocking HTTP request, so it runs on its own thread and
//! leaves the result in a shared slot that the tick loop polls.

use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicIpState {
    Pending,
    Found(IpAddr),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct PublicIpLookup {
    state: Arc<Mutex<PublicIpState>>,
}

impl PublicIpLookup {
    /// Starts a lookup against `endpoint` (`host:port`), requesting `path`.
    pub fn spawn(endpoint: impl Into<String>, path: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let path = path.into();
        let state = Arc::new(Mutex::new(PublicIpState::Pending));
        let slot = state.clone();

        let spawned = thread::Builder::new()
            .name("public-ip-lookup".to_string())
            .spawn(move || {
                let result = match fetch_public_ip(&endpoint, &path, timeout) {
                    Ok(ip) => {
                        info!("🌐 Public IP resolved via {}: {}", endpoint, ip);
                        PublicIpState::Found(ip)
                    }
                    Err(e) => {
                        warn!("Public IP lookup via {} failed: {}", endpoint, e);
                        PublicIpState::Failed(e)
                    }
                };
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = result;
            });

        if let Err(e) = spawned {
            *state.lock().unwrap_or_else(PoisonError::into_inner) =
                PublicIpState::Failed(format!("could not start lookup thread: {e}"));
        }

        Self { state }
    }

    /// An already known address, e.g. from configuration.
    pub fn from_known(ip: IpAddr) -> Self {
        Self {
            state: Arc::new(Mutex::new(PublicIpState::Found(ip))),
        }
    }

    pub fn state(&self) -> PublicIpState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn poll(&self) -> Option<IpAddr> {
        match self.state() {
            PublicIpState::Found(ip) => Some(ip),
            _ => None,
        }
    }
}

fn fetch_public_ip(endpoint: &str, path: &str, timeout: Duration) -> Result<IpAddr, String> {
    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {endpoint}: {e}"))?
        .next()
        .ok_or_else(|| format!("no address for {endpoint}"))?;

    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| format!("failed to connect: {e}"))?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();

    let host = endpoint.rsplit_once(':').map_or(endpoint, |(host, _)| host);
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nAccept: text/plain\r\nConnection: close\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("failed to send request: {e}"))?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .map_err(|e| format!("failed to read response: {e}"))?;
    debug!(bytes = response.len(), "Public IP response received");

    parse_ip_response(&response)
}

/// Extracts the address from an HTTP response whose body is a bare IP.
pub fn parse_ip_response(response: &str) -> Result<IpAddr, String> {
    let status_line = response.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(format!("unexpected status: {status_line}"));
    }

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .ok_or_else(|| "response has no body".to_string())?;

    body.trim()
        .parse::<IpAddr>()
        .map_err(|e| format!("invalid address '{}': {e}", body.trim()))
}
