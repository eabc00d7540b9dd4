use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    /// Public URL of the coordinating machine; its host anchors the cluster.
    pub root_url: Option<Url>,
    pub root_dir: PathBuf,
    /// Unpacked distribution providing `bin/hadoop`.
    pub runtime_home: Option<PathBuf>,
    pub rendezvous_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_port: u16,
    pub storage_port: u16,
    pub storage_http_port: u16,
    pub compute_port: u16,
    pub compute_http_port: u16,
    pub replication: u32,
    pub reserved_space: u64,
    /// Rendezvous listener address; see [`Config::rendezvous`] for defaults.
    pub bind_host: Option<IpAddr>,
    pub advertise_host: Option<String>,
    /// Path of the `herd` binary on worker machines.
    pub child_binary: Option<PathBuf>,
    pub startup_grace: Duration,
    pub close_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_url: None,
            root_dir: env::temp_dir().join("herd"),
            runtime_home: None,
            rendezvous_timeout: Duration::from_millis(10_000),
            probe_timeout: Duration::from_millis(500),
            probe_port: 7,
            storage_port: 9000,
            storage_http_port: 12301,
            compute_port: 22000,
            compute_http_port: 22001,
            replication: 1,
            reserved_space: 0,
            bind_host: None,
            advertise_host: None,
            child_binary: None,
            startup_grace: Duration::from_millis(500),
            close_grace: Duration::from_millis(5_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            parsed::<u64, _>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            root_url: lookup("HERD_ROOT_URL").and_then(|raw| Url::parse(raw.trim()).ok()),
            root_dir: lookup("HERD_ROOT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            runtime_home: lookup("HERD_RUNTIME_HOME").map(PathBuf::from),
            rendezvous_timeout: millis("HERD_RENDEZVOUS_TIMEOUT_MS", defaults.rendezvous_timeout),
            probe_timeout: millis("HERD_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            probe_port: parsed(&lookup, "HERD_PROBE_PORT").unwrap_or(defaults.probe_port),
            storage_port: parsed(&lookup, "HERD_STORAGE_PORT").unwrap_or(defaults.storage_port),
            storage_http_port: parsed(&lookup, "HERD_STORAGE_HTTP_PORT")
                .unwrap_or(defaults.storage_http_port),
            compute_port: parsed(&lookup, "HERD_COMPUTE_PORT").unwrap_or(defaults.compute_port),
            compute_http_port: parsed(&lookup, "HERD_COMPUTE_HTTP_PORT")
                .unwrap_or(defaults.compute_http_port),
            replication: parsed(&lookup, "HERD_REPLICATION").unwrap_or(defaults.replication),
            reserved_space: parsed(&lookup, "HERD_RESERVED_SPACE")
                .unwrap_or(defaults.reserved_space),
            bind_host: parsed(&lookup, "HERD_BIND_HOST"),
            advertise_host: lookup("HERD_ADVERTISE_HOST")
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty()),
            child_binary: lookup("HERD_CHILD_BINARY").map(PathBuf::from),
            startup_grace: millis("HERD_STARTUP_GRACE_MS", defaults.startup_grace),
            close_grace: millis("HERD_CLOSE_GRACE_MS", defaults.close_grace),
        }
    }

    fn root_host(&self) -> Option<&str> {
        self.root_url
            .as_ref()
            .and_then(|url| url.host_str())
            .filter(|host| !host.is_empty())
    }

    /// `hdfs://<root host>:<storage port>/`, or `None` when the root URL is
    /// unknown.
    pub fn storage_url(&self) -> Option<String> {
        self.root_host()
            .map(|host| format!("hdfs://{host}:{}/", self.storage_port))
    }

    /// Where workers find the compute coordinator.
    pub fn compute_address(&self) -> Option<String> {
        self.root_host()
            .map(|host| format!("{host}:{}", self.compute_port))
    }

    /// Listener address and dial-back host for a child. Local children use
    /// loopback; remote ones bind the wildcard address and dial the root URL
    /// host. Explicit settings win in both cases.
    pub fn rendezvous(&self, remote: bool) -> (IpAddr, String) {
        let loopback = Ipv4Addr::LOCALHOST.to_string();
        let (bind, advertise) = if remote {
            let host = self.root_host().map(str::to_string).unwrap_or(loopback);
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), host)
        } else {
            (IpAddr::V4(Ipv4Addr::LOCALHOST), loopback)
        };
        (
            self.bind_host.unwrap_or(bind),
            self.advertise_host.clone().unwrap_or(advertise),
        )
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|val| val.trim().parse().ok())
}
