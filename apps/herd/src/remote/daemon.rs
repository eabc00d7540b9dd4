use async_trait::async_trait;
use herd_proto::{DaemonSpec, Settings};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::ProcessExit;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("runtime home is not configured")]
    MissingRuntimeHome,
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {daemon}: {source}")]
    Spawn {
        daemon: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{daemon} exited during startup ({exit})")]
    EarlyExit {
        daemon: &'static str,
        exit: ProcessExit,
    },
    #[error("{step} failed ({exit}): {stderr}")]
    StepFailed {
        step: &'static str,
        exit: ProcessExit,
        stderr: String,
    },
    #[error("{0}")]
    Other(String),
}

/// Starts the wrapped distribution's daemons inside the child process.
#[async_trait]
pub trait DaemonRuntime: Send + Sync {
    async fn storage_init(&self, spec: &DaemonSpec) -> Result<(), DaemonError>;
    async fn compute_init(&self, spec: &DaemonSpec) -> Result<(), DaemonError>;
    async fn storage_start(&self, spec: &DaemonSpec) -> Result<(), DaemonError>;
    async fn compute_start(&self, spec: &DaemonSpec) -> Result<(), DaemonError>;
}

const LAUNCHER: &str = "bin/hadoop";

/// Runs `<runtime-home>/bin/hadoop <daemon> -D key=value ...`.
///
/// Daemons are children of this process and die with it.
pub struct CommandRuntime {
    runtime_home: Option<PathBuf>,
    library_path: Option<String>,
    startup_grace: Duration,
    running: Mutex<Vec<RunningDaemon>>,
}

struct RunningDaemon {
    name: &'static str,
    child: Child,
}

impl CommandRuntime {
    pub fn new(
        runtime_home: Option<PathBuf>,
        library_path: Option<String>,
        startup_grace: Duration,
    ) -> Self {
        Self {
            runtime_home,
            library_path,
            startup_grace,
            running: Mutex::new(Vec::new()),
        }
    }

    pub async fn running(&self) -> Vec<&'static str> {
        self.running.lock().await.iter().map(|d| d.name).collect()
    }

    fn command(&self, args: &[&str], settings: &Settings) -> Result<Command, DaemonError> {
        let home = self
            .runtime_home
            .as_ref()
            .ok_or(DaemonError::MissingRuntimeHome)?;
        let mut command = Command::new(home.join(LAUNCHER));
        command.args(args);
        for (key, value) in settings.iter() {
            command.arg("-D").arg(format!("{key}={value}"));
        }
        if let Some(path) = &self.library_path {
            command.env("HADOOP_CLASSPATH", path);
        }
        if let Some(log_dir) = settings.get("hadoop.log.dir") {
            command.env("HADOOP_LOG_DIR", log_dir);
        }
        command.current_dir(home);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        die_with_parent(&mut command);
        Ok(command)
    }

    async fn run_step(
        &self,
        step: &'static str,
        args: &[&str],
        spec: &DaemonSpec,
    ) -> Result<(), DaemonError> {
        info!(step, "running");
        let output = self
            .command(args, &spec.settings)?
            .output()
            .await
            .map_err(|source| DaemonError::Spawn { daemon: step, source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DaemonError::StepFailed {
                step,
                exit: ProcessExit::from_status(output.status),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn start(&self, name: &'static str, spec: &DaemonSpec) -> Result<(), DaemonError> {
        info!(daemon = name, "starting");
        let mut child = self
            .command(&[name], &spec.settings)?
            .spawn()
            .map_err(|source| DaemonError::Spawn { daemon: name, source })?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(BufReader::new(stdout), name, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(BufReader::new(stderr), name, "stderr"));
        }

        tokio::time::sleep(self.startup_grace).await;
        match child.try_wait() {
            Ok(Some(status)) => Err(DaemonError::EarlyExit {
                daemon: name,
                exit: ProcessExit::from_status(status),
            }),
            Ok(None) => {
                debug!(daemon = name, pid = child.id(), "daemon running");
                self.running.lock().await.push(RunningDaemon { name, child });
                Ok(())
            }
            Err(source) => Err(DaemonError::Spawn { daemon: name, source }),
        }
    }
}

#[async_trait]
impl DaemonRuntime for CommandRuntime {
    async fn storage_init(&self, spec: &DaemonSpec) -> Result<(), DaemonError> {
        prepare_scratch(spec)?;
        self.run_step("namenode -format", &["namenode", "-format"], spec)
            .await?;
        self.start("namenode", spec).await
    }

    async fn compute_init(&self, spec: &DaemonSpec) -> Result<(), DaemonError> {
        prepare_scratch(spec)?;
        self.start("jobtracker", spec).await
    }

    async fn storage_start(&self, spec: &DaemonSpec) -> Result<(), DaemonError> {
        prepare_scratch(spec)?;
        self.start("datanode", spec).await
    }

    async fn compute_start(&self, spec: &DaemonSpec) -> Result<(), DaemonError> {
        prepare_scratch(spec)?;
        self.start("tasktracker", spec).await
    }
}

fn prepare_scratch(spec: &DaemonSpec) -> Result<(), DaemonError> {
    let Some(dir) = spec.scratch_dir.as_deref() else {
        return Ok(());
    };
    let path = Path::new(dir);
    let prepare_error = |source: io::Error| DaemonError::Prepare {
        path: dir.to_string(),
        source,
    };
    if path.exists() {
        info!(path = dir, "wiping scratch directory");
        std::fs::remove_dir_all(path).map_err(prepare_error)?;
    }
    std::fs::create_dir_all(path).map_err(prepare_error)
}

#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_command: &mut Command) {}

async fn forward_lines<R>(mut reader: BufReader<R>, daemon: &'static str, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if !trimmed.is_empty() {
                    info!(target: "herd::daemon", daemon, stream, message = trimmed);
                }
            }
            Err(err) => {
                warn!(
                    target: "herd::daemon",
                    daemon,
                    stream,
                    error = %err,
                    "failed to read daemon output"
                );
                break;
            }
        }
    }
}
