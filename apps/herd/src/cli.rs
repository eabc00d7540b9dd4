use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

use crate::config::Config;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "herd",
    about = "Provision storage and compute daemons on a coordinator and its workers",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HERD_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HERD_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// Overrides for values otherwise read from `HERD_*` variables. The
/// variables themselves are left to [`Config::from_env`], which ignores
/// malformed values.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    #[arg(long, global = true, help = "Public URL of this coordinator")]
    pub root_url: Option<Url>,

    #[arg(long, global = true, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Unpacked distribution containing bin/hadoop"
    )]
    pub runtime_home: Option<PathBuf>,

    #[arg(long, global = true, help = "Address the rendezvous listener binds")]
    pub bind_host: Option<IpAddr>,

    #[arg(
        long,
        global = true,
        help = "Host children dial back to"
    )]
    pub advertise_host: Option<String>,
}

impl ClusterArgs {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(url) = &self.root_url {
            config.root_url = Some(url.clone());
        }
        if let Some(dir) = &self.root_dir {
            config.root_dir = dir.clone();
        }
        if let Some(home) = &self.runtime_home {
            config.runtime_home = Some(home.clone());
        }
        if let Some(host) = self.bind_host {
            config.bind_host = Some(host);
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = Some(host.clone());
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot the master daemons, bring workers online, run until Ctrl-C
    Up(UpArgs),
    /// Bring a single worker online against a running master
    Worker(WorkerArgs),
    /// Print this machine's candidate addresses as JSON
    Candidates,
    #[command(hide = true)]
    Child(ChildArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RemoteArgs {
    #[arg(
        long = "ssh-flag",
        value_name = "FLAG",
        allow_hyphen_values = true,
        help = "Extra flag passed to ssh (repeatable)"
    )]
    pub ssh_flags: Vec<String>,

    #[arg(
        long = "worker-root",
        value_name = "DIR",
        help = "Root directory on workers (defaults to the local root)"
    )]
    pub worker_root: Option<PathBuf>,

    #[arg(
        long = "worker-runtime-home",
        value_name = "DIR",
        help = "Distribution directory on workers"
    )]
    pub worker_runtime_home: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct UpArgs {
    #[arg(
        long = "worker",
        value_name = "NAME=SSH_TARGET",
        value_parser = parse_worker_target,
        help = "Worker to bring online after the master boots (repeatable)"
    )]
    pub workers: Vec<WorkerTarget>,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, value_name = "SSH_TARGET")]
    pub target: String,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Args, Debug)]
pub struct ChildArgs {
    #[arg(long = "connect-to", value_name = "HOST:PORT")]
    pub connect_to: String,

    #[arg(long = "library-path", value_name = "PATHS")]
    pub library_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub name: String,
    pub target: String,
}

/// `NAME=TARGET`, or a bare `TARGET` that doubles as the name.
pub fn parse_worker_target(raw: &str) -> Result<WorkerTarget, String> {
    let (name, target) = match raw.split_once('=') {
        Some((name, target)) => (name.trim(), target.trim()),
        None => (raw.trim(), raw.trim()),
    };
    if name.is_empty() || target.is_empty() {
        return Err(format!("expected NAME=SSH_TARGET, got '{raw}'"));
    }
    Ok(WorkerTarget {
        name: name.to_string(),
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_targets_parse_with_and_without_names() {
        assert_eq!(
            parse_worker_target("rack1=ops@10.0.0.5").expect("named"),
            WorkerTarget {
                name: "rack1".into(),
                target: "ops@10.0.0.5".into()
            }
        );
        assert_eq!(
            parse_worker_target("worker-b").expect("bare").name,
            "worker-b"
        );
        assert!(parse_worker_target("=host").is_err());
    }

    #[test]
    fn child_arguments_parse() {
        let cli = Cli::try_parse_from([
            "herd",
            "child",
            "--log-level",
            "debug",
            "--runtime-home",
            "/opt/hadoop",
            "--connect-to",
            "127.0.0.1:40000",
        ])
        .expect("parse");

        assert_eq!(cli.logging.level, LogLevel::Debug);
        assert_eq!(cli.cluster.runtime_home, Some(PathBuf::from("/opt/hadoop")));
        match cli.command {
            Command::Child(args) => {
                assert_eq!(args.connect_to, "127.0.0.1:40000");
                assert_eq!(args.library_path, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "herd",
            "--root-url",
            "http://ci.example.org/",
            "--advertise-host",
            "10.1.1.1",
            "candidates",
        ])
        .expect("parse");

        let config = cli.cluster.apply(Config::default());
        assert_eq!(
            config.storage_url().as_deref(),
            Some("hdfs://ci.example.org:9000/")
        );
        assert_eq!(config.advertise_host.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn malformed_environment_does_not_abort_parsing() {
        std::env::set_var("HERD_ROOT_URL", "not a url");
        std::env::set_var("HERD_BIND_HOST", "nowhere");
        let parsed = Cli::try_parse_from(["herd", "candidates"]);
        let config = Config::from_env();
        std::env::remove_var("HERD_ROOT_URL");
        std::env::remove_var("HERD_BIND_HOST");

        let cli = parsed.expect("environment is read by Config, not clap");
        assert!(cli.cluster.root_url.is_none());
        let config = cli.cluster.apply(config);
        assert!(config.root_url.is_none());
        assert!(config.bind_host.is_none());
    }
}
