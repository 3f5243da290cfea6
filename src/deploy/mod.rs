//! Provisioning of customer sites on remote hosts.
//!
//! Jobs are queued in the marketplace database and drained by a single
//! [`worker::DeployWorker`], which runs Docker commands over SSH through a
//! [`remote::RemoteShell`] and records each outcome.

pub mod commands;
pub mod executor;
pub mod models;
pub mod queue;
pub mod remote;
pub mod server;
pub mod worker;

pub use executor::DeployExecutor;
pub use remote::{RemoteShell, SshShell};
pub use worker::DeployWorker;
