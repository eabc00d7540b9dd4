#![allow(dead_code)]

use async_trait::async_trait;
use herd_core::address::AddressList;
use herd_core::bootstrap::launcher::{LaunchCommand, LaunchError, Launcher, OutputSink};
use herd_core::process::ProcessHandle;
use herd_core::remote::{run_child, DaemonError, DaemonRuntime, Dispatcher};
use herd_proto::DaemonSpec;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Records each operation; fails those listed in `failing`. `compute-init`
/// waits for a permit on `gate` before answering.
#[derive(Default)]
pub struct ScriptedRuntime {
    pub calls: Mutex<Vec<&'static str>>,
    pub failing: Vec<&'static str>,
    pub gate: Option<Arc<Semaphore>>,
    pub finished: Mutex<Vec<&'static str>>,
}

impl ScriptedRuntime {
    pub fn failing(labels: &[&'static str]) -> Self {
        Self {
            failing: labels.to_vec(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn finished(&self) -> Vec<&'static str> {
        self.finished.lock().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls().iter().filter(|call| **call == label).count()
    }

    async fn run(&self, label: &'static str) -> Result<(), DaemonError> {
        self.calls.lock().push(label);
        if label == "compute-init" {
            if let Some(gate) = &self.gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|err| DaemonError::Other(err.to_string()))?;
            }
        }
        self.finished.lock().push(label);
        if self.failing.contains(&label) {
            return Err(DaemonError::Other(format!("{label} forced to fail")));
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonRuntime for ScriptedRuntime {
    async fn storage_init(&self, _spec: &DaemonSpec) -> Result<(), DaemonError> {
        self.run("storage-init").await
    }

    async fn compute_init(&self, _spec: &DaemonSpec) -> Result<(), DaemonError> {
        self.run("compute-init").await
    }

    async fn storage_start(&self, _spec: &DaemonSpec) -> Result<(), DaemonError> {
        self.run("storage-start").await
    }

    async fn compute_start(&self, _spec: &DaemonSpec) -> Result<(), DaemonError> {
        self.run("compute-start").await
    }
}

/// Runs the child side as a task in this process.
pub struct InProcessLauncher {
    pub runtime: Arc<ScriptedRuntime>,
    pub candidates: Vec<String>,
    pub connect_delay: Duration,
}

impl InProcessLauncher {
    pub fn new(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime,
            candidates: Vec::new(),
            connect_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        _sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError> {
        let connect_to = command
            .argv
            .last()
            .cloned()
            .ok_or(LaunchError::EmptyCommand)?;
        let candidates = self.candidates.clone();
        let dispatcher = Arc::new(
            Dispatcher::new(self.runtime.clone())
                .with_candidates(move || Ok(AddressList::from(candidates.clone()))),
        );
        let delay = self.connect_delay;
        Ok(ProcessHandle::from_task("in-process", async move {
            tokio::time::sleep(delay).await;
            let _ = run_child(&connect_to, dispatcher).await;
        }))
    }

    fn describe(&self) -> String {
        "in-process".into()
    }
}
