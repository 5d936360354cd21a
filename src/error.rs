//! Error types for fixture provisioning.
//!
//! Every fallible library operation returns [`Result`]. Reasons are kept as
//! strings so errors can be cloned into step reports and compared in tests.

use crate::domain::Role;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("container {container} did not accept connections on port {port} within {timeout:?}")]
    StartupTimeout {
        container: String,
        port: u16,
        timeout: Duration,
    },

    #[error("runtime command `{command}` failed: {reason}")]
    RuntimeCommand {
        command: String,
        reason: String,
        not_found: bool,
    },

    #[error("failed to create network {network}: {reason}")]
    NetworkCreate { network: String, reason: String },

    #[error("failed to initiate replica set {replica_set}: {reason}")]
    ReplicaSetInit { replica_set: String, reason: String },

    #[error("failed to verify master node {container}: {reason}")]
    MasterVerification { container: String, reason: String },

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("failed to attach to output of {container}: {reason}")]
    Attach { container: String, reason: String },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("{role} setup failed: {source}")]
    Setup { role: Role, source: Box<Error> },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RuntimeCommand {
            command: command.into(),
            reason: reason.into(),
            not_found: false,
        }
    }

    pub(crate) fn not_found(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RuntimeCommand {
            command: command.into(),
            reason: reason.into(),
            not_found: true,
        }
    }

    /// True when the runtime reported that the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RuntimeCommand {
                not_found: true,
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The error of the step that failed, with the `Setup` wrapper removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::Setup { source, .. } => source.root(),
            other => other,
        }
    }
}
