mod common;

use async_trait::async_trait;
use common::{InProcessLauncher, ScriptedRuntime};
use herd_core::bootstrap::launcher::{
    LaunchCommand, LaunchError, Launcher, LocalLauncher, OutputSink, TracingSink,
};
use herd_core::bootstrap::{BootstrapConfig, BootstrapError, Bootstrapper, LaunchSpec};
use herd_core::channel::ChannelError;
use herd_core::process::{ExitWatch, ProcessExit, ProcessHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(timeout: Duration) -> BootstrapConfig {
    BootstrapConfig {
        accept_timeout: timeout,
        close_grace: Duration::from_secs(2),
        ..BootstrapConfig::default()
    }
}

fn sink() -> Arc<dyn OutputSink> {
    Arc::new(TracingSink::new("test"))
}

/// Launches a fixed local command in place of the requested one, keeping
/// the requested argument vector and an exit watch for inspection.
struct SubstituteLauncher {
    argv: Vec<String>,
    requested: Mutex<Option<Vec<String>>>,
    exit: Mutex<Option<ExitWatch>>,
}

impl SubstituteLauncher {
    fn new(argv: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            requested: Mutex::new(None),
            exit: Mutex::new(None),
        })
    }

    fn rendezvous_port(&self) -> u16 {
        let requested = self.requested.lock();
        let connect_to = requested
            .as_ref()
            .and_then(|argv| argv.last())
            .expect("launch was requested");
        connect_to
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .expect("connect-to carries a port")
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exit.lock().clone().expect("process launched")
    }
}

#[async_trait]
impl Launcher for SubstituteLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError> {
        *self.requested.lock() = Some(command.argv.clone());
        let substitute = LaunchCommand {
            argv: self.argv.clone(),
            ..command
        };
        let handle = LocalLauncher.launch(substitute, sink).await?;
        *self.exit.lock() = Some(handle.exit_watch());
        Ok(handle)
    }

    fn describe(&self) -> String {
        "substitute".into()
    }
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(20)]
async fn child_that_never_connects_times_out_and_releases_the_port() {
    let launcher = SubstituteLauncher::new(&["sleep", "30"]);
    let timeout = Duration::from_millis(400);
    let bootstrapper = Bootstrapper::new(launcher.clone(), config(timeout));

    let started = Instant::now();
    let err = bootstrapper
        .bootstrap(&LaunchSpec::new("silent", "herd"), None, sink())
        .await
        .expect_err("never connects");
    let elapsed = started.elapsed();

    assert!(matches!(err, BootstrapError::Timeout(t) if t == timeout));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {elapsed:?}");

    let port = launcher.rendezvous_port();
    std::net::TcpListener::bind(("127.0.0.1", port)).expect("rendezvous port released");

    let exit = tokio::time::timeout(Duration::from_secs(2), launcher.exit_watch().wait())
        .await
        .expect("orphaned child terminated");
    assert_eq!(exit, ProcessExit::Killed);
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(20)]
async fn child_that_exits_early_fails_fast() {
    let launcher = SubstituteLauncher::new(&["sh", "-c", "exit 4"]);
    let bootstrapper = Bootstrapper::new(launcher.clone(), config(Duration::from_secs(10)));

    let started = Instant::now();
    let err = bootstrapper
        .bootstrap(&LaunchSpec::new("broken", "herd"), None, sink())
        .await
        .expect_err("exits");

    assert!(matches!(err, BootstrapError::ChildExited(ProcessExit::Code(4))));
    assert!(started.elapsed() < Duration::from_secs(5));
    std::net::TcpListener::bind(("127.0.0.1", launcher.rendezvous_port()))
        .expect("rendezvous port released");
}

/// Fails every launch after noting where the child was told to dial.
#[derive(Default)]
struct FailingLauncher {
    connect_to: Mutex<Option<String>>,
}

#[async_trait]
impl Launcher for FailingLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        _sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError> {
        *self.connect_to.lock() = command.argv.last().cloned();
        Err(LaunchError::Spawn {
            program: "herd".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "not executable"),
        })
    }

    fn describe(&self) -> String {
        "failing".into()
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn launch_failure_is_reported_and_releases_the_port() {
    let launcher = Arc::new(FailingLauncher::default());
    let bootstrapper = Bootstrapper::new(launcher.clone(), config(Duration::from_secs(10)));

    let started = Instant::now();
    let err = bootstrapper
        .bootstrap(&LaunchSpec::new("unlaunchable", "herd"), None, sink())
        .await
        .expect_err("spawn fails");

    assert!(matches!(err, BootstrapError::Launch(LaunchError::Spawn { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));

    let connect_to = launcher.connect_to.lock().clone().expect("launch requested");
    let port: u16 = connect_to
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .expect("connect-to carries a port");
    std::net::TcpListener::bind(("127.0.0.1", port)).expect("rendezvous port released");
}

#[test_timeout::tokio_timeout_test(20)]
async fn connected_child_round_trips_and_dies_on_close() {
    let runtime = Arc::new(ScriptedRuntime::default());
    let launcher = Arc::new(InProcessLauncher::new(runtime));
    let bootstrapper = Bootstrapper::new(launcher, config(Duration::from_secs(5)));

    let handle = bootstrapper
        .bootstrap(&LaunchSpec::new("in-process", "herd"), None, sink())
        .await
        .expect("bootstrap");
    handle.channel().ping().await.expect("ping");

    let exit = handle.process().exit_watch();
    assert_eq!(handle.close().await, Some(ProcessExit::Killed));
    assert_eq!(exit.current(), Some(ProcessExit::Killed));
}

#[test_timeout::tokio_timeout_test(30)]
async fn herd_child_binary_serves_the_channel() {
    let bootstrapper = Bootstrapper::new(Arc::new(LocalLauncher), config(Duration::from_secs(10)));
    let spec = LaunchSpec {
        env: vec![("RUST_LOG".into(), "warn".into())],
        ..LaunchSpec::new("herd-child", env!("CARGO_BIN_EXE_herd"))
    };

    let handle = bootstrapper
        .bootstrap(&spec, None, sink())
        .await
        .expect("bootstrap real child");
    handle.channel().ping().await.expect("ping");
    handle
        .channel()
        .enumerate_candidates()
        .await
        .expect("candidates");

    let exit = handle.process().exit_watch();
    assert!(handle.close().await.is_some());
    assert!(exit.current().is_some());
}

#[test_timeout::tokio_timeout_test(20)]
async fn channel_is_lost_when_the_child_goes_away() {
    let runtime = Arc::new(ScriptedRuntime::default());
    let launcher = Arc::new(InProcessLauncher::new(runtime));
    let bootstrapper = Bootstrapper::new(launcher, config(Duration::from_secs(5)));

    let handle = bootstrapper
        .bootstrap(&LaunchSpec::new("in-process", "herd"), None, sink())
        .await
        .expect("bootstrap");
    handle.process().kill();
    handle.process().wait().await;

    let mut lost = false;
    for _ in 0..50 {
        if handle.is_lost() {
            lost = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(lost);
    let err = handle.channel().ping().await.expect_err("lost");
    assert!(matches!(err, ChannelError::Lost(_)));
}
