use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};

use super::CandidateParseError;
use super::names::reverse_lookup;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn resolve(&self, candidate: &str) -> Result<IpAddr, CandidateParseError>;
    async fn is_reachable(&self, ip: IpAddr, timeout: Duration) -> bool;
    async fn canonical_name(&self, ip: IpAddr) -> String;
}

/// Reachability by TCP connect. A refused connection still proves the host
/// answered, so it counts as reachable.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    port: u16,
}

impl NetworkProber {
    pub const DEFAULT_PORT: u16 = 7;

    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PORT)
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn resolve(&self, candidate: &str) -> Result<IpAddr, CandidateParseError> {
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            return Ok(ip);
        }
        let parse_error = |source: io::Error| CandidateParseError {
            candidate: candidate.to_string(),
            source,
        };
        let mut addrs = lookup_host((candidate, 0)).await.map_err(parse_error)?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| parse_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
    }

    async fn is_reachable(&self, ip: IpAddr, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((ip, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => err.kind() == io::ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }

    async fn canonical_name(&self, ip: IpAddr) -> String {
        tokio::task::spawn_blocking(move || reverse_lookup(ip))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| ip.to_string())
    }
}
