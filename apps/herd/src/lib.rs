pub mod address;
pub mod app;
pub mod bootstrap;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod remote;
pub mod supervisor;
pub mod telemetry;
