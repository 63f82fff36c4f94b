//! Error kinds the monitors make policy decisions on.

use std::time::Duration;

use thiserror::Error;

/// Message fragment a PowerFlex array returns when it no longer knows the host.
const NO_CORRESPONDING_SDC: &str = "there is no corresponding SDC";

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("driver error: {}", .0.message())]
    Driver(#[from] tonic::Status),

    #[error("driver transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("driver is not connected")]
    DriverUnavailable,

    #[error("Could not determine CSI NodeID for node {node}")]
    MissingCsiNodeId { node: String },

    #[error("parsing {key} failed: value was {value}")]
    Config { key: String, value: String },

    #[error("unable to read driver config file {path}: {message}")]
    ConfigFile { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The referenced object does not exist (any more).
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::Driver(status) => status.code() == tonic::Code::NotFound,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Optimistic concurrency failure on an update.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Driver asked us to come back later; worth retrying the same call.
    pub fn is_pending(&self) -> bool {
        match self {
            Error::Driver(status) => status.message().ends_with("pending"),
            _ => false,
        }
    }

    /// The array reports it has no record of the host at all, which is as
    /// good as a negative connectivity answer.
    pub fn is_no_corresponding_sdc(&self) -> bool {
        match self {
            Error::Driver(status) => status.message().contains(NO_CORRESPONDING_SDC),
            _ => false,
        }
    }
}
