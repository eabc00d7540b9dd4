use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::address;
use crate::bootstrap;
use crate::bootstrap::launcher::{LocalLauncher, SshLauncher};
use crate::cli::{ChildArgs, Cli, Command, RemoteArgs, UpArgs, WorkerArgs, WorkerTarget};
use crate::config::Config;
use crate::error::HerdError;
use crate::remote::{self, CommandRuntime, Dispatcher};
use crate::supervisor::{Deployment, Supervisor, WorkerSpec};
use crate::telemetry::logging::LogLevel;

pub async fn run(cli: Cli) -> Result<(), HerdError> {
    let config = cli.cluster.apply(Config::from_env());
    let level = cli.logging.level;
    match cli.command {
        Command::Up(args) => run_up(config, level, args).await,
        Command::Worker(args) => run_worker(config, level, args).await,
        Command::Candidates => print_candidates(),
        Command::Child(args) => run_child(&config, args).await,
    }
}

fn worker_spec(config: &Config, target: &WorkerTarget, remote: &RemoteArgs) -> WorkerSpec {
    let launcher = SshLauncher {
        ssh_flags: remote.ssh_flags.clone(),
        ..SshLauncher::new(target.target.clone())
    };
    WorkerSpec {
        name: target.name.clone(),
        launcher: Arc::new(launcher),
        root_dir: remote
            .worker_root
            .clone()
            .unwrap_or_else(|| config.root_dir.clone()),
        program: config
            .child_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("herd")),
        runtime_home: remote
            .worker_runtime_home
            .clone()
            .or_else(|| config.runtime_home.clone()),
    }
}

fn log_outcome(what: &str, outcome: Result<Deployment, crate::orchestrator::OrchestratorError>) {
    match outcome {
        Ok(Deployment::Started) => info!(deployment = what, "deployment started"),
        Ok(Deployment::Skipped) => info!(deployment = what, "deployment skipped"),
        Err(err) => warn!(deployment = what, error = %err, "deployment failed"),
    }
}

async fn run_up(config: Config, level: LogLevel, args: UpArgs) -> Result<(), HerdError> {
    let specs: Vec<WorkerSpec> = args
        .workers
        .iter()
        .map(|target| worker_spec(&config, target, &args.remote))
        .collect();
    let supervisor = Arc::new(Supervisor::new(config, level, Arc::new(LocalLauncher)));

    log_outcome("master", supervisor.boot_master().await);

    let onlines = specs.into_iter().map(|spec| {
        let supervisor = supervisor.clone();
        async move {
            let name = spec.name.clone();
            log_outcome(&name, supervisor.worker_online(spec).await);
        }
    });
    futures::future::join_all(onlines).await;

    info!(workers = ?supervisor.workers().await, "cluster up; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    supervisor.shutdown().await;
    Ok(())
}

async fn run_worker(config: Config, level: LogLevel, args: WorkerArgs) -> Result<(), HerdError> {
    let target = WorkerTarget {
        name: args.name,
        target: args.target,
    };
    let spec = worker_spec(&config, &target, &args.remote);
    let supervisor = Supervisor::new(config, level, Arc::new(LocalLauncher));

    match supervisor.worker_online(spec).await? {
        Deployment::Started => {
            info!(worker = %target.name, "worker online; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
        Deployment::Skipped => info!(worker = %target.name, "worker skipped"),
    }
    supervisor.shutdown().await;
    Ok(())
}

fn print_candidates() -> Result<(), HerdError> {
    let candidates = address::enumerate_candidates()?;
    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

async fn run_child(config: &Config, args: ChildArgs) -> Result<(), HerdError> {
    let runtime_home = config.runtime_home.clone();
    let library_path = args
        .library_path
        .or_else(|| runtime_home.as_deref().and_then(bootstrap::library_path));
    let runtime = CommandRuntime::new(runtime_home, library_path, config.startup_grace);
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(runtime)));
    remote::run_child(&args.connect_to, dispatcher).await?;
    info!("parent disconnected; exiting");
    Ok(())
}
