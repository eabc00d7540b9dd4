//! Runs a [`StartupPlan`] over one channel and owns that channel's teardown.

pub mod plan;

use async_trait::async_trait;
use herd_proto::{Operation, SubmitMode};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapError;
use crate::channel::{ChannelError, ChannelHandle};
use crate::process::ProcessExit;
pub use plan::{ClusterSettings, Phase, PlanEntry, Role, StartupPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Idle,
    ChannelReady,
    StorageReady,
    ComputeSubmitted,
    Running,
    Failed,
}

impl StartupState {
    pub fn as_str(self) -> &'static str {
        match self {
            StartupState::Idle => "idle",
            StartupState::ChannelReady => "channel-ready",
            StartupState::StorageReady => "storage-ready",
            StartupState::ComputeSubmitted => "compute-submitted",
            StartupState::Running => "running",
            StartupState::Failed => "failed",
        }
    }
}

impl fmt::Display for StartupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot start plan in state {0}")]
    NotReady(StartupState),
    #[error("{role} plan does not fit a {expected} orchestrator")]
    RoleMismatch { role: &'static str, expected: &'static str },
    #[error("compute phase requested before storage was ready")]
    OutOfOrder,
    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("failed to prepare {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The remote execution primitive a plan runs against.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn call(&self, operation: Operation) -> Result<(), ChannelError>;

    /// Queues `operation`; any failure is logged by the executor, never
    /// returned.
    fn submit(&self, operation: Operation) -> Result<(), ChannelError>;

    async fn close(&self) -> Option<ProcessExit>;
}

#[async_trait]
impl RemoteExecutor for ChannelHandle {
    async fn call(&self, operation: Operation) -> Result<(), ChannelError> {
        self.channel().execute(operation).await
    }

    fn submit(&self, operation: Operation) -> Result<(), ChannelError> {
        self.channel().execute_detached(operation)
    }

    async fn close(&self) -> Option<ProcessExit> {
        self.terminate().await
    }
}

pub struct ClusterOrchestrator<E> {
    name: String,
    role: Role,
    state: StartupState,
    executor: Option<E>,
}

impl<E: RemoteExecutor> ClusterOrchestrator<E> {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            state: StartupState::Idle,
            executor: None,
        }
    }

    /// An orchestrator whose channel already exists.
    pub fn with_executor(name: impl Into<String>, role: Role, executor: E) -> Self {
        let mut orchestrator = Self::new(name, role);
        orchestrator.attach(executor);
        orchestrator
    }

    pub fn attach(&mut self, executor: E) {
        self.executor = Some(executor);
        self.transition(StartupState::ChannelReady);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> StartupState {
        self.state
    }

    pub fn executor(&self) -> Option<&E> {
        self.executor.as_ref()
    }

    fn transition(&mut self, next: StartupState) {
        advance(&self.name, self.role, &mut self.state, next);
    }

    /// Executes `plan` in order. Returns once every awaited entry finished
    /// and every detached entry was queued.
    pub async fn start(&mut self, plan: StartupPlan) -> Result<(), OrchestratorError> {
        if self.state != StartupState::ChannelReady {
            return Err(OrchestratorError::NotReady(self.state));
        }
        if plan.role() != self.role {
            return Err(OrchestratorError::RoleMismatch {
                role: plan.role().as_str(),
                expected: self.role.as_str(),
            });
        }
        let Some(executor) = self.executor.as_ref() else {
            return Err(OrchestratorError::NotReady(self.state));
        };

        let mut state = self.state;
        let mut outcome = Ok(());
        for entry in plan.into_entries() {
            let label = entry.operation.label();
            if entry.phase == Phase::Compute && state != StartupState::StorageReady {
                outcome = Err(OrchestratorError::OutOfOrder);
                break;
            }
            let result = match entry.mode {
                SubmitMode::Await => executor.call(entry.operation).await,
                SubmitMode::Detach => executor.submit(entry.operation),
            };
            if let Err(source) = result {
                warn!(
                    orchestrator = %self.name,
                    operation = label,
                    error = %source,
                    "startup step failed"
                );
                outcome = Err(OrchestratorError::Operation {
                    operation: label,
                    source,
                });
                break;
            }
            debug!(
                orchestrator = %self.name,
                operation = label,
                mode = ?entry.mode,
                "startup step accepted"
            );
            state = match entry.phase {
                Phase::Storage => StartupState::StorageReady,
                Phase::Compute => StartupState::ComputeSubmitted,
            };
            advance(&self.name, self.role, &mut self.state, state);
        }

        match outcome {
            Ok(()) => {
                self.transition(StartupState::Running);
                info!(orchestrator = %self.name, role = self.role.as_str(), "daemons started");
                Ok(())
            }
            Err(err) => {
                self.transition(StartupState::Failed);
                Err(err)
            }
        }
    }

    /// Closes the channel, which kills the backing process and every daemon
    /// it started.
    pub async fn shutdown(&mut self) -> Option<ProcessExit> {
        let executor = self.executor.take()?;
        info!(orchestrator = %self.name, "closing channel");
        let exit = executor.close().await;
        self.state = StartupState::Idle;
        exit
    }
}

fn advance(name: &str, role: Role, state: &mut StartupState, next: StartupState) {
    debug!(
        orchestrator = %name,
        role = role.as_str(),
        from = state.as_str(),
        to = next.as_str(),
        "state change"
    );
    *state = next;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records what was called or submitted; fails the named operation.
    #[derive(Clone, Default)]
    pub struct RecordingExecutor {
        pub calls: Arc<Mutex<Vec<(&'static str, SubmitMode)>>>,
        pub fail_on: Option<&'static str>,
        pub closed: Arc<AtomicBool>,
    }

    impl RecordingExecutor {
        pub fn failing(label: &'static str) -> Self {
            Self {
                fail_on: Some(label),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<(&'static str, SubmitMode)> {
            self.calls.lock().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn record(&self, operation: &Operation, mode: SubmitMode) -> Result<(), ChannelError> {
            let label = operation.label();
            self.calls.lock().push((label, mode));
            if self.fail_on == Some(label) {
                return Err(ChannelError::Remote(herd_proto::RemoteFailure::new(format!(
                    "{label} refused"
                ))));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteExecutor for RecordingExecutor {
        async fn call(&self, operation: Operation) -> Result<(), ChannelError> {
            self.record(&operation, SubmitMode::Await)
        }

        fn submit(&self, operation: Operation) -> Result<(), ChannelError> {
            // detached failures are swallowed, as they are over a real channel
            let _ = self.record(&operation, SubmitMode::Detach);
            Ok(())
        }

        async fn close(&self) -> Option<ProcessExit> {
            self.closed.store(true, Ordering::SeqCst);
            Some(ProcessExit::Killed)
        }
    }
}
