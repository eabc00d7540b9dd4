//! Launches a herd child and turns its dial-back connection into a
//! [`ChannelHandle`].
//!
//! The parent binds a single-use rendezvous listener on an ephemeral port,
//! launches the child with `--connect-to <advertise-host>:<port>` as its last
//! argument and accepts exactly one connection. The listener is closed on
//! every path out of [`Bootstrapper::bootstrap`]; a child that was launched
//! but never connected is killed.

pub mod launcher;

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelHandle};
use crate::process::{ProcessExit, ProcessHandle};
use crate::telemetry::logging::LogLevel;
use launcher::{LaunchCommand, LaunchError, Launcher, OutputSink};

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to open rendezvous socket on {host}: {source}")]
    Bind {
        host: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("child did not connect within {0:?}")]
    Timeout(Duration),
    #[error("child exited before connecting ({0})")]
    ChildExited(ProcessExit),
    #[error("failed to accept child connection: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub bind_host: IpAddr,
    /// Host the child dials; must reach `bind_host` from the child's machine.
    pub advertise_host: String,
    pub accept_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([127, 0, 0, 1]),
            advertise_host: "127.0.0.1".into(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            close_grace: ChannelHandle::DEFAULT_CLOSE_GRACE,
        }
    }
}

/// What to run on the far side of the channel.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub log_level: LogLevel,
    pub runtime_home: Option<PathBuf>,
    pub library_path: Option<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            log_level: LogLevel::Info,
            runtime_home: None,
            library_path: None,
            env: Vec::new(),
        }
    }

    /// The child's argument vector. `--connect-to` is always last.
    pub fn arguments(&self, connect_to: &str) -> Vec<String> {
        let mut args = vec![
            self.program.to_string_lossy().into_owned(),
            "child".to_string(),
            "--log-level".to_string(),
            self.log_level.as_str().to_string(),
        ];
        if let Some(home) = &self.runtime_home {
            args.push("--runtime-home".into());
            args.push(home.to_string_lossy().into_owned());
        }
        if let Some(path) = self.library_path.as_deref().filter(|p| !p.is_empty()) {
            args.push("--library-path".into());
            args.push(path.to_string());
        }
        args.push("--connect-to".into());
        args.push(connect_to.to_string());
        args
    }
}

/// Collects `hadoop-*-core.jar` from the top of `home`, then every jar under
/// `home/lib`, each group sorted, joined with the platform separator.
pub fn library_path(home: &Path) -> Option<String> {
    let mut core = Vec::new();
    if let Ok(entries) = std::fs::read_dir(home) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("hadoop-") && name.ends_with("-core.jar") {
                core.push(entry.path());
            }
        }
    }
    core.sort();

    let mut libs = Vec::new();
    collect_jars(&home.join("lib"), &mut libs);
    libs.sort();

    let jars: Vec<PathBuf> = core.into_iter().chain(libs).collect();
    if jars.is_empty() {
        return None;
    }
    std::env::join_paths(&jars)
        .ok()
        .map(|joined| joined.to_string_lossy().into_owned())
}

fn collect_jars(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_jars(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "jar") {
            out.push(path);
        }
    }
}

pub struct Bootstrapper {
    launcher: Arc<dyn Launcher>,
    config: BootstrapConfig,
}

impl Bootstrapper {
    pub fn new(launcher: Arc<dyn Launcher>, config: BootstrapConfig) -> Self {
        Self { launcher, config }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub async fn bootstrap(
        &self,
        spec: &LaunchSpec,
        work_dir: Option<&Path>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ChannelHandle, BootstrapError> {
        let listener = TcpListener::bind((self.config.bind_host, 0))
            .await
            .map_err(|source| BootstrapError::Bind {
                host: self.config.bind_host,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| BootstrapError::Bind {
                host: self.config.bind_host,
                source,
            })?
            .port();
        let connect_to = format!("{}:{port}", self.config.advertise_host);

        let command = LaunchCommand {
            argv: spec.arguments(&connect_to),
            env: spec.env.clone(),
            work_dir: work_dir.map(Path::to_path_buf),
        };
        info!(
            child = %spec.name,
            launcher = %self.launcher.describe(),
            rendezvous = %connect_to,
            "launching child"
        );
        let process = self.launcher.launch(command, sink).await?;

        let accepted = tokio::select! {
            biased;
            accepted = tokio::time::timeout(self.config.accept_timeout, listener.accept()) => {
                accepted
            }
            exit = process.wait() => {
                warn!(child = %spec.name, exit = %exit, "child exited before connecting");
                return Err(BootstrapError::ChildExited(exit));
            }
        };
        drop(listener);

        let stream = match accepted {
            Ok(Ok((stream, peer))) => {
                debug!(child = %spec.name, peer = %peer, "child connected");
                stream
            }
            Ok(Err(err)) => {
                abandon(&spec.name, process).await;
                return Err(BootstrapError::Accept(err));
            }
            Err(_) => {
                warn!(
                    child = %spec.name,
                    timeout_ms = self.config.accept_timeout.as_millis() as u64,
                    "child never connected"
                );
                abandon(&spec.name, process).await;
                return Err(BootstrapError::Timeout(self.config.accept_timeout));
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(child = %spec.name, error = %err, "failed to set TCP_NODELAY");
        }

        let channel = Channel::new(spec.name.clone(), stream);
        Ok(ChannelHandle::new(channel, process).with_close_grace(self.config.close_grace))
    }
}

async fn abandon(name: &str, process: ProcessHandle) {
    process.kill();
    if tokio::time::timeout(Duration::from_secs(1), process.wait())
        .await
        .is_err()
    {
        warn!(child = %name, "abandoned child did not exit promptly");
    }
}
