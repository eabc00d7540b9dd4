//! The child end of a bootstrapped channel.
//!
//! `herd child --connect-to HOST:PORT` dials the parent's rendezvous socket
//! and serves requests strictly one at a time, in arrival order. When the
//! parent goes away the stream ends and the child exits, taking its daemons
//! with it.

pub mod daemon;

use herd_proto::{Envelope, Operation, RemoteFailure, Request, Response};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::address::{self, AddressError, AddressList};
use crate::channel::{frame, ChannelError};
pub use daemon::{CommandRuntime, DaemonError, DaemonRuntime};

type CandidateSource = Arc<dyn Fn() -> Result<AddressList, AddressError> + Send + Sync>;

/// Executes tagged operations against a [`DaemonRuntime`].
pub struct Dispatcher {
    runtime: Arc<dyn DaemonRuntime>,
    candidates: CandidateSource,
}

impl Dispatcher {
    pub fn new(runtime: Arc<dyn DaemonRuntime>) -> Self {
        Self {
            runtime,
            candidates: Arc::new(address::enumerate_candidates),
        }
    }

    pub fn with_candidates<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<AddressList, AddressError> + Send + Sync + 'static,
    {
        self.candidates = Arc::new(source);
        self
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::EnumerateCandidates => {
                // hostname and reverse lookups block
                let source = self.candidates.clone();
                match tokio::task::spawn_blocking(move || source()).await {
                    Ok(Ok(list)) => Response::Candidates(list.into_inner()),
                    Ok(Err(err)) => Response::Failed(RemoteFailure::new(err.to_string())),
                    Err(err) => Response::Failed(RemoteFailure::new(format!(
                        "candidate enumeration aborted: {err}"
                    ))),
                }
            }
            Request::Execute(operation) => {
                let label = operation.label();
                info!(operation = label, "executing");
                let result = match &operation {
                    Operation::StorageInit(spec) => self.runtime.storage_init(spec).await,
                    Operation::ComputeInit(spec) => self.runtime.compute_init(spec).await,
                    Operation::StorageStart(spec) => self.runtime.storage_start(spec).await,
                    Operation::ComputeStart(spec) => self.runtime.compute_start(spec).await,
                };
                match result {
                    Ok(()) => Response::Done,
                    Err(err) => {
                        warn!(operation = label, error = %err, "operation failed");
                        Response::Failed(RemoteFailure::new(err.to_string()))
                    }
                }
            }
        }
    }
}

/// Serves requests from `stream` until the peer hangs up.
pub async fn serve<S>(stream: S, dispatcher: Arc<Dispatcher>) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    while let Some(envelope) = frame::read_frame::<_, Envelope<Request>>(&mut reader).await? {
        debug!(
            id = envelope.id,
            operation = envelope.body.label(),
            mode = ?envelope.mode,
            "request"
        );
        let body = dispatcher.handle(envelope.body).await;
        frame::write_frame(
            &mut writer,
            &Envelope {
                id: envelope.id,
                mode: envelope.mode,
                body,
            },
        )
        .await?;
    }
    debug!("parent closed the channel");
    Ok(())
}

/// Dials back to the parent and serves until it disconnects.
pub async fn run_child(connect_to: &str, dispatcher: Arc<Dispatcher>) -> Result<(), ChannelError> {
    let stream = TcpStream::connect(connect_to).await?;
    stream.set_nodelay(true)?;
    info!(connect_to, "connected to parent");
    serve(stream, dispatcher).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::daemon::testing::RecordingRuntime;
    use herd_proto::DaemonSpec;

    #[tokio::test]
    async fn candidates_come_from_the_configured_source() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingRuntime::default()))
            .with_candidates(|| Ok(AddressList::from(vec!["worker-a".to_string()])));
        let response = dispatcher.handle(Request::EnumerateCandidates).await;
        assert_eq!(response, Response::Candidates(vec!["worker-a".into()]));
    }

    #[tokio::test]
    async fn enumeration_runs_off_the_runtime_thread() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let record = seen.clone();
        let dispatcher = Dispatcher::new(Arc::new(RecordingRuntime::default())).with_candidates(
            move || {
                *record.lock() = Some(std::thread::current().id());
                Err(AddressError::Interfaces(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no interfaces",
                )))
            },
        );

        let response = dispatcher.handle(Request::EnumerateCandidates).await;

        assert!(matches!(response, Response::Failed(_)));
        let worker = seen.lock().expect("source called");
        assert_ne!(worker, std::thread::current().id());
    }

    #[tokio::test]
    async fn runtime_errors_become_failed_responses() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingRuntime::failing("compute-init")));
        let response = dispatcher
            .handle(Request::Execute(Operation::ComputeInit(DaemonSpec::default())))
            .await;
        assert!(matches!(response, Response::Failed(_)));
    }
}
