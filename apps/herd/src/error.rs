use std::io;
use thiserror::Error;

use crate::address::AddressError;
use crate::channel::ChannelError;
use crate::orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum HerdError {
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
