pub mod buffer;
pub mod grpc;

use std::time::Duration;

use thiserror::Error;

use crate::tracer::event::ConnectionEvent;

/// Acknowledgment returned by the remote sink for one delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    /// Number of events carried by the batch.
    pub events: usize,
    /// Status string from the sink ("OK").
    pub message: String,
    /// Sink-assigned batch identifier.
    pub batch_id: String,
}

/// How a failed dispatch should be read by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout or transport trouble. A later batch may well succeed.
    Transient,
    /// The sink refuses this client outright (wrong service, auth, state).
    /// Later batches will fail the same way until someone intervenes.
    Fatal,
    /// The batch itself was unacceptable.
    Malformed,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Malformed => "malformed",
        }
    }
}

/// Errors from one delivery attempt. The batch is lost in every case.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("refusing to dispatch an empty batch")]
    EmptyBatch,

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected batch ({code:?}): {message}")]
    Rejected { code: tonic::Code, message: String },
}

impl DispatchError {
    /// Classify a gRPC status returned for a dispatch call.
    pub fn from_status(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable
            | tonic::Code::Unknown
            | tonic::Code::Cancelled
            | tonic::Code::DeadlineExceeded
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted => Self::Unavailable(status.message().to_owned()),
            code => Self::Rejected {
                code,
                message: status.message().to_owned(),
            },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EmptyBatch => FailureKind::Malformed,
            Self::Rejected { code, .. } => match code {
                tonic::Code::InvalidArgument | tonic::Code::OutOfRange => FailureKind::Malformed,
                tonic::Code::Unimplemented
                | tonic::Code::Unauthenticated
                | tonic::Code::PermissionDenied
                | tonic::Code::FailedPrecondition
                | tonic::Code::NotFound => FailureKind::Fatal,
                _ => FailureKind::Transient,
            },
            Self::Timeout(_) | Self::Unavailable(_) => FailureKind::Transient,
        }
    }
}

/// Dispatcher delivers one flushed batch to the central sink.
///
/// Implementations must bound the total time of a call; the agent loop
/// does not poll the source while a dispatch is in flight.
pub trait Dispatcher: Send {
    /// Returns the dispatcher's name for logging.
    fn name(&self) -> &str;

    /// Deliver `batch` and wait for its acknowledgment.
    fn dispatch(
        &mut self,
        batch: Vec<ConnectionEvent>,
    ) -> impl std::future::Future<Output = Result<DispatchReceipt, DispatchError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let e = DispatchError::from_status(tonic::Status::unavailable("conn refused"));
        assert!(matches!(e, DispatchError::Unavailable(_)));
        assert_eq!(e.kind(), FailureKind::Transient);

        let e = DispatchError::from_status(tonic::Status::invalid_argument("empty batch"));
        assert!(matches!(
            e,
            DispatchError::Rejected {
                code: tonic::Code::InvalidArgument,
                ..
            }
        ));
        assert_eq!(e.kind(), FailureKind::Malformed);

        let e = DispatchError::from_status(tonic::Status::internal("boom"));
        assert_eq!(e.kind(), FailureKind::Transient);

        for status in [
            tonic::Status::unimplemented("unknown service traffic.TrafficService"),
            tonic::Status::unauthenticated("missing token"),
            tonic::Status::permission_denied("node not allowed"),
            tonic::Status::failed_precondition("sink draining"),
            tonic::Status::not_found("no such method"),
        ] {
            let code = status.code();
            let e = DispatchError::from_status(status);
            assert!(matches!(e, DispatchError::Rejected { .. }), "{code:?}");
            assert_eq!(e.kind(), FailureKind::Fatal, "{code:?}");
        }
    }

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::Transient.as_str(), "transient");
        assert_eq!(FailureKind::Fatal.as_str(), "fatal");
        assert_eq!(FailureKind::Malformed.as_str(), "malformed");
    }

    #[test]
    fn test_local_failures() {
        assert_eq!(DispatchError::EmptyBatch.kind(), FailureKind::Malformed);
        assert_eq!(
            DispatchError::Timeout(Duration::from_secs(10)).kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_error_display() {
        let e = DispatchError::Timeout(Duration::from_secs(10));
        assert_eq!(e.to_string(), "no acknowledgment within 10s");

        let e = DispatchError::Rejected {
            code: tonic::Code::InvalidArgument,
            message: "empty batch".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "sink rejected batch (InvalidArgument): empty batch"
        );
    }
}
