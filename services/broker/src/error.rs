//! Broker error taxonomy
//!
//! Every lifecycle call returns one of these to the caller; none of them are
//! fatal to the broker process.

use thiserror::Error;

/// Errors returned by the instance lifecycle controller
#[derive(Debug, Error)]
pub enum BrokerError {
    /// An instance with this id already exists (or is being created)
    #[error("service instance {0} already exists")]
    AlreadyExists(String),

    /// No instance with this id is registered
    #[error("no such service instance with ID {0}")]
    NotFound(String),

    /// The request is missing a required field or names an unknown service
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A create, delete or query call against the orchestration platform failed
    #[error("provisioning failed: {0}")]
    ProvisioningFailure(String),

    /// The backing workload exists but is not ready to serve yet
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Another lifecycle operation on this instance is still in flight
    #[error("operation in progress for service instance {0}")]
    OperationInProgress(String),
}

impl BrokerError {
    /// Stable name of the error kind, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::AlreadyExists(_) => "AlreadyExists",
            BrokerError::NotFound(_) => "NotFound",
            BrokerError::InvalidRequest(_) => "InvalidRequest",
            BrokerError::ProvisioningFailure(_) => "ProvisioningFailure",
            BrokerError::Unavailable(_) => "Unavailable",
            BrokerError::OperationInProgress(_) => "ConcurrencyError",
        }
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
