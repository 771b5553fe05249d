//! Error types for userhub.

use std::net::SocketAddr;

use tonic::Status;
use tracing::error;

use crate::models::UserId;

/// Errors raised while composing or running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server tried to bind.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// `run` was invoked while the server is already listening or serving.
    #[error("server is already running")]
    AlreadyRunning,

    /// `run` was invoked after the server stopped.
    #[error("server has already stopped")]
    AlreadyStopped,

    /// A gRPC service with the same name was registered twice.
    #[error("service '{0}' is already registered")]
    DuplicateService(&'static str),

    /// The persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Host and port do not form a socket address.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
}

/// Result alias for lifecycle and composition operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by capability implementations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Unknown login or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Refresh token unknown, already used, or expired.
    #[error("invalid or expired refresh token")]
    InvalidRefreshToken,

    /// Login is already taken.
    #[error("user already exists")]
    UserExists,

    /// No user with the given id.
    #[error("user {0} not found")]
    UserNotFound(UserId),

    /// The request is malformed from the capability's point of view.
    #[error("{0}")]
    InvalidArgument(String),

    /// The caller's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backing store failure.
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UserExists => ServiceError::UserExists,
            StorageError::UserNotFound(id) => ServiceError::UserNotFound(id),
            other => ServiceError::Storage(other),
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidCredentials => {
                Status::unauthenticated("invalid login or password")
            }
            ServiceError::InvalidRefreshToken => {
                Status::unauthenticated("invalid or expired refresh token")
            }
            ServiceError::UserExists => Status::already_exists("user already exists"),
            ServiceError::UserNotFound(id) => Status::not_found(format!("user {id} not found")),
            ServiceError::InvalidArgument(msg) => Status::invalid_argument(msg),
            ServiceError::DeadlineExceeded => Status::deadline_exceeded("deadline exceeded"),
            ServiceError::Storage(e) => {
                error!(error = %e, "storage failure while handling call");
                Status::internal("internal error")
            }
        }
    }
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Login uniqueness violated.
    #[error("user already exists")]
    UserExists,

    /// Referenced user does not exist.
    #[error("user {0} not found")]
    UserNotFound(UserId),

    /// The storage location cannot be reached.
    #[error("storage location '{0}' is unreachable")]
    Unreachable(String),

    /// Reading or writing the snapshot failed.
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be decoded.
    #[error("snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    #[test]
    fn credential_failures_do_not_leak_details() {
        let status = Status::from(ServiceError::InvalidCredentials);
        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "invalid login or password");
    }

    #[test]
    fn storage_failures_become_generic_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "/var/lib/secret/path");
        let status = Status::from(ServiceError::Storage(StorageError::Io(io)));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "internal error");
    }

    #[test]
    fn every_domain_error_has_a_distinct_code() {
        let cases = [
            (ServiceError::InvalidRefreshToken, Code::Unauthenticated),
            (ServiceError::UserExists, Code::AlreadyExists),
            (ServiceError::UserNotFound(UserId(7)), Code::NotFound),
            (ServiceError::InvalidArgument("bad".into()), Code::InvalidArgument),
            (ServiceError::DeadlineExceeded, Code::DeadlineExceeded),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn storage_conflicts_keep_their_meaning() {
        assert!(matches!(
            ServiceError::from(StorageError::UserExists),
            ServiceError::UserExists
        ));
        assert!(matches!(
            ServiceError::from(StorageError::UserNotFound(UserId(3))),
            ServiceError::UserNotFound(UserId(3))
        ));
    }
}
