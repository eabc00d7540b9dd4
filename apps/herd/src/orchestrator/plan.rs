use herd_proto::{DaemonSpec, Operation, Settings, SubmitMode};
use std::path::Path;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Storage,
    Compute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub phase: Phase,
    pub operation: Operation,
    pub mode: SubmitMode,
}

/// Cluster-wide values every plan is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub storage_url: String,
    pub compute_address: String,
    pub compute_port: u16,
    pub storage_http_port: u16,
    pub compute_http_port: u16,
    pub replication: u32,
    pub reserved_space: u64,
}

impl ClusterSettings {
    /// `None` when the coordinator's own host name is unknown.
    pub fn from_config(config: &Config) -> Option<Self> {
        Some(Self {
            storage_url: config.storage_url()?,
            compute_address: config.compute_address()?,
            compute_port: config.compute_port,
            storage_http_port: config.storage_http_port,
            compute_http_port: config.compute_http_port,
            replication: config.replication,
            reserved_space: config.reserved_space,
        })
    }
}

/// Storage entries always precede compute entries.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupPlan {
    role: Role,
    entries: Vec<PlanEntry>,
}

fn under(root: &Path, relative: &str) -> String {
    root.join(relative).to_string_lossy().into_owned()
}

impl StartupPlan {
    /// Storage namespace first and awaited; the compute coordinator is
    /// detached because it may sit in safe mode for an unbounded time.
    pub fn master(cluster: &ClusterSettings, root: &Path) -> Self {
        let storage = Settings::new()
            .with("fs.default.name", &cluster.storage_url)
            .with(
                "dfs.http.address",
                format!("0.0.0.0:{}", cluster.storage_http_port),
            )
            .with("dfs.name.dir", under(root, "hadoop/namedir"))
            .with("dfs.data.dir", under(root, "hadoop/datadir"))
            .with("dfs.replication", cluster.replication.to_string());
        let compute = Settings::new()
            .with("hadoop.log.dir", under(root, "hadoop/log"))
            .with("fs.default.name", &cluster.storage_url)
            .with(
                "mapred.job.tracker",
                format!("localhost:{}", cluster.compute_port),
            )
            .with(
                "mapred.job.tracker.http.address",
                format!("0.0.0.0:{}", cluster.compute_http_port),
            )
            .with("mapred.local.dir", under(root, "hadoop/mapred"));

        Self {
            role: Role::Master,
            entries: vec![
                PlanEntry {
                    phase: Phase::Storage,
                    operation: Operation::StorageInit(
                        DaemonSpec::new(storage).with_scratch_dir(under(root, "hadoop")),
                    ),
                    mode: SubmitMode::Await,
                },
                PlanEntry {
                    phase: Phase::Compute,
                    operation: Operation::ComputeInit(DaemonSpec::new(compute)),
                    mode: SubmitMode::Detach,
                },
            ],
        }
    }

    /// Both daemons are awaited; a worker is only usable once both run.
    pub fn worker(cluster: &ClusterSettings, root: &Path, advertised_host: &str) -> Self {
        let storage = Settings::new()
            .with("fs.default.name", &cluster.storage_url)
            .with("dfs.data.dir", under(root, "hadoop/datanode"))
            .with("dfs.datanode.du.reserved", cluster.reserved_space.to_string())
            .with("slave.host.name", advertised_host);
        let compute = Settings::new()
            .with("fs.default.name", &cluster.storage_url)
            .with("mapred.job.tracker", &cluster.compute_address)
            .with("mapred.task.tracker.http.address", "0.0.0.0:0")
            .with("mapred.task.tracker.report.address", "0.0.0.0:0")
            .with("mapred.local.dir", under(root, "hadoop/task-tracker"))
            .with("slave.host.name", advertised_host);

        Self {
            role: Role::Worker,
            entries: vec![
                PlanEntry {
                    phase: Phase::Storage,
                    operation: Operation::StorageStart(DaemonSpec::new(storage)),
                    mode: SubmitMode::Await,
                },
                PlanEntry {
                    phase: Phase::Compute,
                    operation: Operation::ComputeStart(DaemonSpec::new(compute)),
                    mode: SubmitMode::Await,
                },
            ],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<PlanEntry> {
        self.entries
    }
}

#[cfg(test)]
pub(crate) fn test_cluster() -> ClusterSettings {
    ClusterSettings {
        storage_url: "hdfs://ci.example.org:9000/".into(),
        compute_address: "ci.example.org:22000".into(),
        compute_port: 22000,
        storage_http_port: 12301,
        compute_http_port: 22001,
        replication: 1,
        reserved_space: 0,
    }
}
