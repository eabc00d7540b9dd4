//! Picks a network identity for a freshly connected machine that the rest
//! of the cluster can actually reach.
//!
//! A machine rarely knows a name others can use: DNS search suffixes, hosts
//! files and multi-homing all get in the way. So the machine lists every
//! name and address it might go by ([`enumerate_candidates`], run on the
//! machine itself) and the coordinator probes them in order
//! ([`AddressResolver::resolve_reachable`]), keeping the first that answers.

pub mod names;
pub mod probe;

use serde::{Deserialize, Serialize};
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use names::{NameService, SystemNames};
pub use probe::{NetworkProber, Prober};

/// A DNS name or a literal IP address.
pub type CandidateAddress = String;

/// Candidates in probe order: host names first, raw IPs last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressList(Vec<CandidateAddress>);

impl AddressList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<CandidateAddress> {
        self.0
    }

    fn push_unique(&mut self, candidate: CandidateAddress) {
        if !self.0.contains(&candidate) {
            self.0.push(candidate);
        }
    }
}

impl From<Vec<CandidateAddress>> for AddressList {
    fn from(candidates: Vec<CandidateAddress>) -> Self {
        Self(candidates)
    }
}

impl<'a> From<&'a [&'a str]> for AddressList {
    fn from(candidates: &'a [&'a str]) -> Self {
        Self(candidates.iter().map(|c| c.to_string()).collect())
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unable to enumerate network interfaces: {0}")]
    Interfaces(#[source] io::Error),
}

/// A candidate string that does not resolve from the probing side.
#[derive(Debug, Error)]
#[error("candidate '{candidate}' does not resolve: {source}")]
pub struct CandidateParseError {
    pub candidate: String,
    #[source]
    pub source: io::Error,
}

/// Lists this machine's candidate addresses, loopback excluded.
pub fn enumerate_candidates() -> Result<AddressList, AddressError> {
    let interfaces = if_addrs::get_if_addrs().map_err(AddressError::Interfaces)?;
    Ok(enumerate_with(
        &SystemNames,
        interfaces.iter().map(|iface| iface.ip()),
    ))
}

pub fn enumerate_with<N, I>(names: &N, addresses: I) -> AddressList
where
    N: NameService + ?Sized,
    I: IntoIterator<Item = IpAddr>,
{
    let mut hostnames = AddressList::new();
    let mut ips = AddressList::new();

    if let Some(local) = names.local_host() {
        if !local.is_loopback() {
            hostnames.push_unique(names.canonical_name(local));
        }
    }

    for ip in addresses {
        if ip.is_loopback() {
            continue;
        }
        hostnames.push_unique(names.canonical_name(ip));
        ips.push_unique(ip.to_string());
    }

    for ip in ips.0 {
        hostnames.push_unique(ip);
    }
    hostnames
}

/// Probes candidates from the coordinator's vantage point.
pub struct AddressResolver<P = NetworkProber> {
    prober: P,
    probe_timeout: Duration,
}

impl<P: Prober> AddressResolver<P> {
    pub fn new(prober: P, probe_timeout: Duration) -> Self {
        Self {
            prober,
            probe_timeout,
        }
    }

    /// First reachable candidate's canonical name, in list order.
    pub async fn resolve_reachable(&self, candidates: &AddressList) -> Option<String> {
        for candidate in candidates.iter() {
            let ip = match self.prober.resolve(candidate).await {
                Ok(ip) => ip,
                Err(err) => {
                    debug!(error = %err, "skipping candidate");
                    continue;
                }
            };
            if self.prober.is_reachable(ip, self.probe_timeout).await {
                let name = self.prober.canonical_name(ip).await;
                info!(candidate, %ip, resolved = %name, "candidate reachable");
                return Some(name);
            }
            debug!(candidate, %ip, "candidate unreachable");
        }
        None
    }
}
