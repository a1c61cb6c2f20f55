use serde::Deserialize;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Builds an error from a numeric gRPC status and optional server message.
pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let code = FirestoreErrorCode::from_grpc_status(code);
    let message = message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("server returned {}", code.as_str()));
    FirestoreError::new(code, message)
}

/// Maps the canonical upper-case status name (`"NOT_FOUND"`) to a code.
pub fn map_status_name(status: &str) -> FirestoreErrorCode {
    match status {
        "CANCELLED" => FirestoreErrorCode::Cancelled,
        "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
        "NOT_FOUND" => FirestoreErrorCode::NotFound,
        "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
        "ABORTED" => FirestoreErrorCode::Aborted,
        "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
        "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
        "INTERNAL" => FirestoreErrorCode::Internal,
        "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
        "DATA_LOSS" => FirestoreErrorCode::DataLoss,
        "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}

/// Decodes an error frame of the form `{"error": {"code", "status", "message"}}`.
///
/// Returns `None` when the payload is not an error frame.
pub fn decode_error_payload(body: &[u8]) -> Option<FirestoreError> {
    let payload = serde_json::from_slice::<GoogleErrorBody>(body).ok()?.error?;
    let code = match (payload.status.as_deref(), payload.code) {
        (Some(status), _) => map_status_name(status),
        (None, Some(code)) => FirestoreErrorCode::from_grpc_status(code),
        (None, None) => FirestoreErrorCode::Unknown,
    };
    let message = payload
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("server returned {}", code.as_str()));
    Some(FirestoreError::new(code, message))
}

/// Whether an operation failing with `code` must not be retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Write-stream variant: `Aborted` means a contended transaction and is retried.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}
