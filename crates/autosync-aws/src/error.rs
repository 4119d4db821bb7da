//! SDK error classification
//!
//! | Condition                                        | StoreError         |
//! |--------------------------------------------------|--------------------|
//! | timeout, dispatch failure, 408, 429, 5xx         | `Transient`        |
//! | throttling error codes                           | `Transient`        |
//! | 401, 403, access-denied error codes              | `PermissionDenied` |
//! | 404, not-found error codes                       | `NotFound`         |
//! | anything else                                    | `Other`            |

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

use autosync_core::domain::errors::StoreError;

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "SlowDown",
    "RequestTimeout",
    "RequestLimitExceeded",
    "TooManyUpdates",
    "InternalError",
    "ServiceUnavailable",
];

const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NotFound", "ParameterNotFound"];

/// HTTP status of the failed response, when one was received
pub fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

/// Maps an SDK failure onto the port error type
pub fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return StoreError::Transient(message);
    }

    if let Some(code) = err.code() {
        if THROTTLING_CODES.contains(&code) {
            return StoreError::Transient(message);
        }
        if ACCESS_DENIED_CODES.contains(&code) {
            return StoreError::PermissionDenied(message);
        }
        if NOT_FOUND_CODES.contains(&code) {
            return StoreError::NotFound(message);
        }
    }

    match status_of(&err) {
        Some(401 | 403) => StoreError::PermissionDenied(message),
        Some(404) => StoreError::NotFound(message),
        Some(408 | 429) | Some(500..=599) => StoreError::Transient(message),
        _ => StoreError::Other(message),
    }
}
