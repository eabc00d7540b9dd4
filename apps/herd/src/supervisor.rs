//! Lifecycle owner for every channel this coordinator opens.
//!
//! The master orchestrator lives from [`Supervisor::boot_master`] to
//! [`Supervisor::shutdown`]. Each worker gets its own orchestrator, created
//! when it comes online and closed when it goes offline. Nothing here is
//! global; whoever holds the supervisor holds the channels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::AddressResolver;
use crate::address::probe::{NetworkProber, Prober};
use crate::bootstrap::launcher::{Launcher, TracingSink};
use crate::bootstrap::{self, BootstrapConfig, Bootstrapper, LaunchSpec};
use crate::channel::ChannelHandle;
use crate::config::Config;
use crate::orchestrator::{
    ClusterOrchestrator, ClusterSettings, OrchestratorError, Role, StartupPlan,
};
use crate::telemetry::logging::LogLevel;

const UNDETERMINABLE: &str =
    "Unable to determine the hostname/IP address of this system. Skipping deployment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Started,
    Skipped,
}

/// A machine that just became available.
#[derive(Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub launcher: Arc<dyn Launcher>,
    /// Root directory on the worker; daemon state goes under `<root>/hadoop`.
    pub root_dir: PathBuf,
    /// The herd binary as seen from the worker.
    pub program: PathBuf,
    pub runtime_home: Option<PathBuf>,
}

impl std::fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("launcher", &self.launcher.describe())
            .field("root_dir", &self.root_dir)
            .field("program", &self.program)
            .finish()
    }
}

type Orchestrator = ClusterOrchestrator<ChannelHandle>;

pub struct Supervisor<P = NetworkProber> {
    config: Config,
    log_level: LogLevel,
    local: Arc<dyn Launcher>,
    resolver: AddressResolver<P>,
    master: Mutex<Option<Orchestrator>>,
    workers: Mutex<HashMap<String, Orchestrator>>,
}

impl Supervisor<NetworkProber> {
    pub fn new(config: Config, log_level: LogLevel, local: Arc<dyn Launcher>) -> Self {
        let prober = NetworkProber::new(config.probe_port);
        Self::with_prober(config, log_level, local, prober)
    }
}

impl<P: Prober> Supervisor<P> {
    pub fn with_prober(
        config: Config,
        log_level: LogLevel,
        local: Arc<dyn Launcher>,
        prober: P,
    ) -> Self {
        let resolver = AddressResolver::new(prober, config.probe_timeout);
        Self {
            config,
            log_level,
            local,
            resolver,
            master: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn bootstrap_config(&self, launcher: &dyn Launcher) -> BootstrapConfig {
        let (bind_host, advertise_host) = self.config.rendezvous(launcher.is_remote());
        BootstrapConfig {
            bind_host,
            advertise_host,
            accept_timeout: self.config.rendezvous_timeout,
            close_grace: self.config.close_grace,
        }
    }

    fn launch_spec(
        &self,
        name: &str,
        program: PathBuf,
        runtime_home: Option<PathBuf>,
    ) -> LaunchSpec {
        let library_path = runtime_home.as_deref().and_then(bootstrap::library_path);
        LaunchSpec {
            log_level: self.log_level,
            runtime_home,
            library_path,
            ..LaunchSpec::new(name, program)
        }
    }

    fn cluster(&self) -> Option<ClusterSettings> {
        let cluster = ClusterSettings::from_config(&self.config);
        if cluster.is_none() {
            info!("Skipping initialization because we don't know the root URL");
        }
        cluster
    }

    /// Starts the storage namespace and compute coordinator on this machine.
    pub async fn boot_master(&self) -> Result<Deployment, OrchestratorError> {
        let Some(cluster) = self.cluster() else {
            return Ok(Deployment::Skipped);
        };
        let mut master = self.master.lock().await;
        if master.is_some() {
            warn!("master channel already open");
            return Ok(Deployment::Started);
        }

        let root = self.config.root_dir.clone();
        if let Err(err) = tokio::fs::create_dir_all(&root).await {
            warn!(path = %root.display(), error = %err, "failed to create root directory");
            return Err(OrchestratorError::WorkDir { path: root, source: err });
        }
        let program = std::env::current_exe().unwrap_or_else(|err| {
            debug!(error = %err, "current executable unknown; relying on PATH");
            PathBuf::from("herd")
        });
        let spec = self.launch_spec("master", program, self.config.runtime_home.clone());

        let bootstrapper =
            Bootstrapper::new(self.local.clone(), self.bootstrap_config(self.local.as_ref()));
        let handle = match bootstrapper
            .bootstrap(&spec, Some(&root), Arc::new(TracingSink::new("master")))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to bootstrap master channel");
                return Err(err.into());
            }
        };

        let mut orchestrator = Orchestrator::with_executor("master", Role::Master, handle);
        if let Err(err) = orchestrator.start(StartupPlan::master(&cluster, &root)).await {
            warn!(error = %err, "master startup failed");
            orchestrator.shutdown().await;
            return Err(err);
        }
        *master = Some(orchestrator);
        Ok(Deployment::Started)
    }

    /// Starts storage and compute nodes on a worker that just connected.
    pub async fn worker_online(
        &self,
        worker: WorkerSpec,
    ) -> Result<Deployment, OrchestratorError> {
        let Some(cluster) = self.cluster() else {
            return Ok(Deployment::Skipped);
        };
        if self.worker_offline(&worker.name).await {
            debug!(worker = %worker.name, "replaced stale worker channel");
        }

        let spec = self.launch_spec(
            &worker.name,
            worker.program.clone(),
            worker.runtime_home.clone(),
        );
        let config = self.bootstrap_config(worker.launcher.as_ref());
        let bootstrapper = Bootstrapper::new(worker.launcher.clone(), config);
        let handle = match bootstrapper
            .bootstrap(&spec, None, Arc::new(TracingSink::new(worker.name.clone())))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(worker = %worker.name, error = %err, "failed to bootstrap worker channel");
                return Err(err.into());
            }
        };

        let candidates = match handle.channel().enumerate_candidates().await {
            Ok(candidates) => candidates,
            Err(err) => {
                debug!(worker = %worker.name, error = %err, "failed to list worker addresses");
                warn!(worker = %worker.name, "{UNDETERMINABLE}");
                handle.close().await;
                return Ok(Deployment::Skipped);
            }
        };
        debug!(worker = %worker.name, candidates = ?candidates, "probing worker candidates");
        let Some(address) = self.resolver.resolve_reachable(&candidates).await else {
            warn!(worker = %worker.name, "{UNDETERMINABLE}");
            handle.close().await;
            return Ok(Deployment::Skipped);
        };
        info!(worker = %worker.name, address = %address, "worker address resolved");

        let mut orchestrator =
            Orchestrator::with_executor(worker.name.clone(), Role::Worker, handle);
        let plan = StartupPlan::worker(&cluster, &worker.root_dir, &address);
        if let Err(err) = orchestrator.start(plan).await {
            warn!(worker = %worker.name, error = %err, "worker startup failed");
            orchestrator.shutdown().await;
            return Err(err);
        }
        self.workers.lock().await.insert(worker.name, orchestrator);
        Ok(Deployment::Started)
    }

    /// Closes the named worker's channel. Returns whether one was open.
    pub async fn worker_offline(&self, name: &str) -> bool {
        let removed = self.workers.lock().await.remove(name);
        match removed {
            Some(mut orchestrator) => {
                orchestrator.shutdown().await;
                info!(worker = %name, "worker channel closed");
                true
            }
            None => false,
        }
    }

    pub async fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn master_running(&self) -> bool {
        self.master.lock().await.is_some()
    }

    /// Workers first, then the master.
    pub async fn shutdown(&self) {
        let workers: Vec<Orchestrator> =
            self.workers.lock().await.drain().map(|(_, o)| o).collect();
        for mut orchestrator in workers {
            orchestrator.shutdown().await;
        }
        if let Some(mut master) = self.master.lock().await.take() {
            master.shutdown().await;
        }
        info!("all channels closed");
    }
}
