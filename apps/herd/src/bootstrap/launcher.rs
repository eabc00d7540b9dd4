use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tracing::{info, warn};

use crate::process::ProcessHandle;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch command is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
}

impl LaunchCommand {
    fn program(&self) -> Result<&str, LaunchError> {
        self.argv
            .first()
            .map(String::as_str)
            .ok_or(LaunchError::EmptyCommand)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives a launched child's output, one line at a time.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: OutputStream, line: &str);
}

#[derive(Debug, Clone)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn line(&self, stream: OutputStream, line: &str) {
        info!(target: "herd::child", child = %self.label, stream = stream.as_str(), message = line);
    }
}

/// Runs a command somewhere and hands back a handle to it.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        command: LaunchCommand,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError>;

    fn describe(&self) -> String;

    /// Whether the child runs on another machine and must dial back over
    /// the network.
    fn is_remote(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalLauncher;

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError> {
        let program = command.program()?.to_string();
        let mut process = TokioCommand::new(&program);
        process.args(&command.argv[1..]);
        process.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &command.work_dir {
            process.current_dir(dir);
        }
        spawn_piped(process, &program, sink)
    }

    fn describe(&self) -> String {
        "local".into()
    }
}

/// Runs the command on another machine over ssh. Killing the local ssh
/// process tears down the remote session.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    pub ssh_binary: String,
    pub target: String,
    pub ssh_flags: Vec<String>,
    pub batch_mode: bool,
}

impl SshLauncher {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            ssh_binary: "ssh".into(),
            target: target.into(),
            ssh_flags: Vec::new(),
            batch_mode: true,
        }
    }

    pub fn ssh_argv(&self, command: &LaunchCommand) -> Vec<String> {
        let mut argv = vec![self.ssh_binary.clone()];
        if self.batch_mode {
            argv.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        argv.push("-T".into());
        argv.extend(self.ssh_flags.iter().cloned());
        argv.push(self.target.clone());
        argv.push(render_remote_command(command));
        argv
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    async fn launch(
        &self,
        command: LaunchCommand,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ProcessHandle, LaunchError> {
        command.program()?;
        let argv = self.ssh_argv(&command);
        info!(
            target = %self.target,
            ssh_binary = %self.ssh_binary,
            remote_command = %argv[argv.len() - 1],
            "launching over ssh"
        );
        let mut process = TokioCommand::new(&argv[0]);
        process.args(&argv[1..]);
        spawn_piped(process, &self.ssh_binary, sink)
    }

    fn describe(&self) -> String {
        format!("ssh {}", self.target)
    }

    fn is_remote(&self) -> bool {
        true
    }
}

fn spawn_piped(
    mut process: TokioCommand,
    program: &str,
    sink: Arc<dyn OutputSink>,
) -> Result<ProcessHandle, LaunchError> {
    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);
    let mut child = process.spawn().map_err(|source| LaunchError::Spawn {
        program: program.to_string(),
        source,
    })?;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(
            BufReader::new(stdout),
            sink.clone(),
            OutputStream::Stdout,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(BufReader::new(stderr), sink, OutputStream::Stderr));
    }
    Ok(ProcessHandle::from_child(program, child))
}

async fn forward_output<R>(
    mut reader: BufReader<R>,
    sink: Arc<dyn OutputSink>,
    stream: OutputStream,
) where
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
                    sink.line(stream, trimmed);
                }
            }
            Err(err) => {
                warn!(
                    target: "herd::child",
                    stream = stream.as_str(),
                    error = %err,
                    "failed to read child output"
                );
                break;
            }
        }
    }
}

pub fn render_remote_command(command: &LaunchCommand) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = &command.work_dir {
        parts.push(format!("cd {} &&", shell_quote(&dir.to_string_lossy())));
    }
    parts.push("exec".to_string());
    if !command.env.is_empty() {
        parts.push("env".to_string());
        for (key, value) in &command.env {
            parts.push(format!("{key}={}", shell_quote(value)));
        }
    }
    parts.extend(command.argv.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn quoting_survives_embedded_single_quotes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn ssh_argv_wraps_the_remote_command() {
        let launcher = SshLauncher {
            ssh_flags: vec!["-p".into(), "2222".into()],
            ..SshLauncher::new("ops@worker-a")
        };
        let command = LaunchCommand {
            argv: vec![
                "/opt/herd/herd".into(),
                "child".into(),
                "--connect-to".into(),
                "10.0.0.1:4100".into(),
            ],
            env: vec![("RUST_LOG".into(), "info".into())],
            work_dir: Some(PathBuf::from("/srv/hudson")),
        };

        let argv = launcher.ssh_argv(&command);

        assert_eq!(
            &argv[..6],
            &["ssh", "-o", "BatchMode=yes", "-T", "-p", "2222"]
        );
        assert_eq!(argv[6], "ops@worker-a");
        assert_eq!(
            argv[7],
            "cd '/srv/hudson' && exec env RUST_LOG='info' '/opt/herd/herd' 'child' '--connect-to' '10.0.0.1:4100'"
        );
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<(OutputStream, String)>>);

    impl OutputSink for CollectingSink {
        fn line(&self, stream: OutputStream, line: &str) {
            self.0.lock().push((stream, line.to_string()));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_launcher_forwards_output_to_sink() {
        let sink = Arc::new(CollectingSink::default());
        let command = LaunchCommand {
            argv: vec!["sh".into(), "-c".into(), "echo out; echo err 1>&2".into()],
            ..LaunchCommand::default()
        };
        let handle = LocalLauncher
            .launch(command, sink.clone())
            .await
            .expect("launch");
        handle.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let lines = sink.0.lock().clone();
        assert!(lines.contains(&(OutputStream::Stdout, "out".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "err".to_string())));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = LocalLauncher
            .launch(LaunchCommand::default(), Arc::new(TracingSink::new("none")))
            .await
            .expect_err("empty");
        assert!(matches!(err, LaunchError::EmptyCommand));
    }
}
