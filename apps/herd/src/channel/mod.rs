//! Ordered request/response channel to a spawned herd child.
//!
//! One writer task drains an unbounded queue, so frames leave in submission
//! order; the child serves them one at a time, so they also execute in that
//! order. Replies are matched to callers by envelope id.

pub mod frame;

use herd_proto::{Envelope, Operation, RemoteFailure, Request, Response, SubmitMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::address::AddressList;
use crate::process::{ExitWatch, ProcessExit, ProcessHandle};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel lost: {0}")]
    Lost(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("remote operation failed: {0}")]
    Remote(RemoteFailure),
    #[error("unexpected response to {request}: {response:?}")]
    Unexpected {
        request: &'static str,
        response: Response,
    },
}

enum Pending {
    Await(oneshot::Sender<Response>),
    Detach(&'static str),
}

#[derive(Default)]
struct Inner {
    pending: HashMap<u64, Pending>,
    lost: Option<String>,
}

struct Shared {
    name: String,
    inner: Mutex<Inner>,
}

impl Shared {
    fn mark_lost(&self, reason: String) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.lost.is_some() {
                return;
            }
            debug!(channel = %self.name, reason = %reason, "channel lost");
            inner.lost = Some(reason);
            std::mem::take(&mut inner.pending)
        };
        for (id, pending) in drained {
            if let Pending::Detach(label) = pending {
                warn!(
                    channel = %self.name,
                    id,
                    operation = label,
                    "detached operation outcome unknown; channel lost"
                );
            }
        }
    }

    fn lost_error(&self) -> ChannelError {
        let reason = self
            .inner
            .lock()
            .lost
            .clone()
            .unwrap_or_else(|| "reply dropped".into());
        ChannelError::Lost(reason)
    }

    fn complete(&self, envelope: Envelope<Response>) {
        let pending = self.inner.lock().pending.remove(&envelope.id);
        match pending {
            Some(Pending::Await(tx)) => {
                let _ = tx.send(envelope.body);
            }
            Some(Pending::Detach(label)) => match envelope.body {
                Response::Failed(failure) => warn!(
                    channel = %self.name,
                    id = envelope.id,
                    operation = label,
                    error = %failure,
                    "detached operation failed"
                ),
                other => debug!(
                    channel = %self.name,
                    id = envelope.id,
                    operation = label,
                    response = ?other,
                    "detached operation completed"
                ),
            },
            None => warn!(channel = %self.name, id = envelope.id, "reply for unknown request"),
        }
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Channel {
    pub fn new<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        });
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let read_shared = shared.clone();
        let read_task = tokio::spawn(async move {
            loop {
                match frame::read_frame::<_, Envelope<Response>>(&mut reader).await {
                    Ok(Some(envelope)) => read_shared.complete(envelope),
                    Ok(None) => {
                        read_shared.mark_lost("remote closed the connection".into());
                        break;
                    }
                    Err(err) => {
                        read_shared.mark_lost(format!("read failed: {err}"));
                        break;
                    }
                }
            }
        });

        let write_shared = shared.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                };
                if let Err(err) = written.await {
                    write_shared.mark_lost(format!("write failed: {err}"));
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            shared,
            next_id: AtomicU64::new(1),
            outbound,
            tasks: vec![read_task, write_task],
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_lost(&self) -> bool {
        self.shared.inner.lock().lost.is_some()
    }

    pub fn mark_lost(&self, reason: impl Into<String>) {
        self.shared.mark_lost(reason.into());
    }

    fn enqueue(
        &self,
        request: Request,
        mode: SubmitMode,
    ) -> Result<Option<oneshot::Receiver<Response>>, ChannelError> {
        let label = request.label();
        let mut inner = self.shared.inner.lock();
        if let Some(reason) = &inner.lost {
            return Err(ChannelError::Lost(reason.clone()));
        }
        // ids are taken under the lock so queue order matches id order
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = frame::encode(&Envelope {
            id,
            mode,
            body: request,
        })?;
        let (pending, rx) = match mode {
            SubmitMode::Await => {
                let (tx, rx) = oneshot::channel();
                (Pending::Await(tx), Some(rx))
            }
            SubmitMode::Detach => (Pending::Detach(label), None),
        };
        inner.pending.insert(id, pending);
        if self.outbound.send(frame).is_err() {
            inner.pending.remove(&id);
            return Err(ChannelError::Lost("writer stopped".into()));
        }
        debug!(channel = %self.shared.name, id, operation = label, ?mode, "queued request");
        Ok(rx)
    }

    /// Sends `request` and waits for its reply.
    pub async fn call(&self, request: Request) -> Result<Response, ChannelError> {
        let rx = self
            .enqueue(request, SubmitMode::Await)?
            .ok_or_else(|| ChannelError::Lost("no reply slot".into()))?;
        match rx.await {
            Ok(Response::Failed(failure)) => Err(ChannelError::Remote(failure)),
            Ok(response) => Ok(response),
            Err(_) => Err(self.shared.lost_error()),
        }
    }

    /// Queues `request` without waiting; the outcome is only logged.
    pub fn submit(&self, request: Request) -> Result<(), ChannelError> {
        self.enqueue(request, SubmitMode::Detach).map(|_| ())
    }

    pub async fn execute(&self, operation: Operation) -> Result<(), ChannelError> {
        let label = operation.label();
        match self.call(Request::Execute(operation)).await? {
            Response::Done => Ok(()),
            response => Err(ChannelError::Unexpected {
                request: label,
                response,
            }),
        }
    }

    pub fn execute_detached(&self, operation: Operation) -> Result<(), ChannelError> {
        self.submit(Request::Execute(operation))
    }

    pub async fn ping(&self) -> Result<(), ChannelError> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            response => Err(ChannelError::Unexpected {
                request: "ping",
                response,
            }),
        }
    }

    pub async fn enumerate_candidates(&self) -> Result<AddressList, ChannelError> {
        match self.call(Request::EnumerateCandidates).await? {
            Response::Candidates(candidates) => Ok(AddressList::from(candidates)),
            response => Err(ChannelError::Unexpected {
                request: "enumerate-candidates",
                response,
            }),
        }
    }

    fn shutdown(&self) {
        self.shared.mark_lost("channel closed".into());
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A channel whose lifetime is bound to the process behind it: closing the
/// channel kills the process, and the process exiting loses the channel.
pub struct ChannelHandle {
    channel: Arc<Channel>,
    process: ProcessHandle,
    watcher: JoinHandle<()>,
    close_grace: Duration,
}

impl ChannelHandle {
    pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

    pub fn new(channel: Channel, process: ProcessHandle) -> Self {
        let channel = Arc::new(channel);
        let watched = channel.clone();
        let exit: ExitWatch = process.exit_watch();
        let watcher = tokio::spawn(async move {
            let exit = exit.wait().await;
            watched.mark_lost(format!("process exited ({exit})"));
        });
        Self {
            channel,
            process,
            watcher,
            close_grace: Self::DEFAULT_CLOSE_GRACE,
        }
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn is_lost(&self) -> bool {
        self.channel.is_lost()
    }

    /// Closes the channel and terminates the backing process.
    pub async fn close(self) -> Option<ProcessExit> {
        self.terminate().await
    }

    /// [`close`](Self::close) for holders that only have a reference.
    /// Returns `None` if the process outlived the grace period.
    pub async fn terminate(&self) -> Option<ProcessExit> {
        self.channel.shutdown();
        self.process.kill();
        match tokio::time::timeout(self.close_grace, self.process.wait()).await {
            Ok(exit) => {
                debug!(channel = %self.channel.name(), exit = %exit, "channel closed");
                Some(exit)
            }
            Err(_) => {
                warn!(
                    channel = %self.channel.name(),
                    grace_ms = self.close_grace.as_millis() as u64,
                    "process did not exit after close"
                );
                None
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.watcher.abort();
        self.process.kill();
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel.name())
            .field("process", &self.process)
            .field("lost", &self.channel.is_lost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{serve, Dispatcher};
    use crate::remote::daemon::testing::RecordingRuntime;
    use herd_proto::DaemonSpec;

    fn connected(runtime: Arc<RecordingRuntime>) -> (Channel, JoinHandle<()>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let dispatcher = Arc::new(Dispatcher::new(runtime));
        let server = tokio::spawn(async move {
            let _ = serve(remote, dispatcher).await;
        });
        (Channel::new("test", local), server)
    }

    #[tokio::test]
    async fn awaited_calls_round_trip() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (channel, _server) = connected(runtime.clone());

        channel.ping().await.expect("ping");
        channel
            .execute(Operation::StorageStart(DaemonSpec::default()))
            .await
            .expect("storage start");
        assert_eq!(runtime.executed(), vec!["storage-start"]);
    }

    #[tokio::test]
    async fn remote_failures_surface_to_awaiting_caller() {
        let runtime = Arc::new(RecordingRuntime::failing("storage-start"));
        let (channel, _server) = connected(runtime);

        let err = channel
            .execute(Operation::StorageStart(DaemonSpec::default()))
            .await
            .expect_err("failure");
        assert!(matches!(err, ChannelError::Remote(_)));
    }

    #[tokio::test]
    async fn detached_and_awaited_requests_execute_in_submission_order() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (channel, _server) = connected(runtime.clone());

        channel
            .execute_detached(Operation::ComputeInit(DaemonSpec::default()))
            .expect("detach");
        channel
            .execute_detached(Operation::StorageStart(DaemonSpec::default()))
            .expect("detach");
        channel
            .execute(Operation::ComputeStart(DaemonSpec::default()))
            .await
            .expect("await");
        assert_eq!(
            runtime.executed(),
            vec!["compute-init", "storage-start", "compute-start"]
        );
    }

    #[tokio::test]
    async fn remote_hangup_loses_the_channel() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (channel, server) = connected(runtime);
        channel.ping().await.expect("ping");

        server.abort();
        let _ = server.await;

        let err = channel.ping().await.expect_err("lost");
        assert!(matches!(err, ChannelError::Lost(_)));
        assert!(channel.is_lost());
    }

    #[tokio::test]
    async fn process_exit_loses_the_handle() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (channel, _server) = connected(runtime);
        let process = ProcessHandle::from_task("stand-in", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        let handle = ChannelHandle::new(channel, process);

        handle.process().wait().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.is_lost());
        let err = handle.channel().ping().await.expect_err("lost");
        assert!(matches!(err, ChannelError::Lost(_)));
    }

    #[tokio::test]
    async fn closing_the_handle_kills_the_process() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (channel, _server) = connected(runtime);
        let process = ProcessHandle::from_task("stand-in", std::future::pending::<()>());
        let handle = ChannelHandle::new(channel, process);
        let exit = handle.process().exit_watch();

        assert_eq!(handle.close().await, Some(ProcessExit::Killed));
        assert_eq!(exit.current(), Some(ProcessExit::Killed));
    }
}
