use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
    /// Terminated at our request.
    Killed,
    /// An in-process stand-in returned on its own.
    Finished,
    WaitFailed(String),
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessExit::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessExit::Signal(signal);
            }
        }

        ProcessExit::WaitFailed("unknown status".into())
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {code}"),
            ProcessExit::Signal(signal) => write!(f, "signal {signal}"),
            ProcessExit::Killed => f.write_str("killed"),
            ProcessExit::Finished => f.write_str("finished"),
            ProcessExit::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

/// Observes a process's exit without holding on to the process itself.
#[derive(Debug, Clone)]
pub struct ExitWatch(watch::Receiver<Option<ProcessExit>>);

impl ExitWatch {
    pub async fn wait(mut self) -> ProcessExit {
        match self.0.wait_for(Option::is_some).await {
            Ok(exit) => match &*exit {
                Some(exit) => exit.clone(),
                None => ProcessExit::WaitFailed("no exit recorded".into()),
            },
            Err(_) => ProcessExit::WaitFailed("process supervisor ended".into()),
        }
    }

    pub fn current(&self) -> Option<ProcessExit> {
        self.0.borrow().clone()
    }
}

/// Handle to a launched process. Dropping the handle terminates the process.
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit: ExitWatch,
}

impl ProcessHandle {
    pub fn from_child(label: impl Into<String>, mut child: Child) -> Self {
        let label = label.into();
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let task_label = label.clone();

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ProcessExit::from_status(status),
                    Err(err) => ProcessExit::WaitFailed(err.to_string()),
                },
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        warn!(process = %task_label, error = %err, "failed to signal process");
                    }
                    match child.wait().await {
                        Ok(_) => ProcessExit::Killed,
                        Err(err) => ProcessExit::WaitFailed(err.to_string()),
                    }
                }
            };
            debug!(process = %task_label, exit = %exit, "process ended");
            let _ = exit_tx.send(Some(exit));
        });

        Self {
            label,
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit: ExitWatch(exit_rx),
        }
    }

    /// Runs `body` as if it were a process; killing the handle cancels it.
    pub fn from_task<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            tokio::pin!(body);
            let exit = tokio::select! {
                _ = &mut body => ProcessExit::Finished,
                _ = kill_rx => ProcessExit::Killed,
            };
            let _ = exit_tx.send(Some(exit));
        });

        Self {
            label,
            pid: None,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit: ExitWatch(exit_rx),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests termination. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.current()
    }

    pub async fn wait(&self) -> ProcessExit {
        self.exit.clone().wait().await
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exit", &self.exit.current())
            .finish()
    }
}
