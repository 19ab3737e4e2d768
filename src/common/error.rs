//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Corrupt log entry at segment {segment} offset {offset}: {reason}")]
    CorruptEntry {
        segment: u32,
        offset: u64,
        reason: String,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    // === Replication Errors ===
    #[error("Out of sync: segment {segment} already purged, log holds [{earliest},{latest}]")]
    OutOfSync {
        segment: u32,
        earliest: u32,
        latest: u32,
    },

    #[error("Shutdown in progress: {0}")]
    Shutdown(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionFailed(_))
    }

    /// The source no longer holds the requested log segment
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self, Error::OutOfSync { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown(_))
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::OutOfSync { .. } => tonic::Status::new(Code::OutOfRange, self.to_string()),
            Error::InvalidConfig(_) => tonic::Status::new(Code::InvalidArgument, self.to_string()),
            Error::Shutdown(_) | Error::ConnectionFailed(_) => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::Corrupted(_) | Error::CorruptEntry { .. } => {
                tonic::Status::new(Code::DataLoss, self.to_string())
            }
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }
}

/// Peer-side statuses are folded back into the local taxonomy so the follow
/// loops can tell transient failures from terminal ones.
impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::Unavailable | Code::Cancelled | Code::Aborted | Code::DeadlineExceeded => {
                Error::ConnectionFailed(status.message().to_string())
            }
            Code::NotFound => Error::NotFound(status.message().to_string()),
            Code::InvalidArgument => Error::InvalidConfig(status.message().to_string()),
            _ => Error::Grpc(status),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionFailed("peer down".into()).is_retryable());
        assert!(Error::from(tonic::Status::deadline_exceeded("tail")).is_retryable());
        assert!(!Error::InvalidConfig("rf".into()).is_retryable());
        assert!(!Error::OutOfSync {
            segment: 1,
            earliest: 3,
            latest: 5
        }
        .is_retryable());
    }

    #[test]
    fn test_grpc_status_round_trip() {
        let err = Error::ConnectionFailed("reset".into());
        let back: Error = err.to_grpc_status().into();
        assert!(back.is_retryable());

        let status = Error::OutOfSync {
            segment: 0,
            earliest: 2,
            latest: 4,
        }
        .to_grpc_status();
        assert_eq!(status.code(), tonic::Code::OutOfRange);
    }
}
