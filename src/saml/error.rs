use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::observability::metrics;

/// Stable machine-readable classification of a [`SamlError`].
///
/// These codes are what operators see in logs and metrics, so they never
/// change with the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    DecodeError,
    ReplayOrUnknownRequest,
    InvalidSignature,
    NoSignaturePresent,
    UnknownKey,
    DecryptionFailed,
    ExpiredAssertion,
    StatusDenied,
    UntrustedTenant,
    DisabledClient,
    InvalidDestination,
    InvalidIssuer,
    InvalidAudience,
    MissingAssertion,
    Configuration,
    Internal,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::DecodeError => "DECODE_ERROR",
            ErrorReason::ReplayOrUnknownRequest => "REPLAY_OR_UNKNOWN_REQUEST",
            ErrorReason::InvalidSignature => "INVALID_SIGNATURE",
            ErrorReason::NoSignaturePresent => "NO_SIGNATURE_PRESENT",
            ErrorReason::UnknownKey => "UNKNOWN_KEY",
            ErrorReason::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorReason::ExpiredAssertion => "EXPIRED_ASSERTION",
            ErrorReason::StatusDenied => "STATUS_DENIED",
            ErrorReason::UntrustedTenant => "UNTRUSTED_TENANT",
            ErrorReason::DisabledClient => "DISABLED_CLIENT",
            ErrorReason::InvalidDestination => "INVALID_DESTINATION",
            ErrorReason::InvalidIssuer => "INVALID_ISSUER",
            ErrorReason::InvalidAudience => "INVALID_AUDIENCE",
            ErrorReason::MissingAssertion => "MISSING_ASSERTION",
            ErrorReason::Configuration => "CONFIGURATION",
            ErrorReason::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the protocol engine.
///
/// Every variant is fatal to the current login or logout attempt. None of
/// them is retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    #[error("Malformed SAML message: {0}")]
    Decode(String),

    #[error("Unknown, expired or already consumed request: {0}")]
    ReplayOrUnknownRequest(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("No signature present at {0} level")]
    NoSignaturePresent(&'static str),

    #[error("No trusted key available: {0}")]
    UnknownKey(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Assertion is not valid at the current time: {0}")]
    ExpiredAssertion(String),

    #[error("Identity provider denied the request: {status}")]
    StatusDenied {
        status: String,
        message: Option<String>,
    },

    #[error("No trusted tenant for request: {0}")]
    UntrustedTenant(String),

    #[error("Client is disabled: {0}")]
    DisabledClient(String),

    #[error("Destination mismatch: expected '{expected}', got '{actual}'")]
    InvalidDestination { expected: String, actual: String },

    #[error("Issuer mismatch: expected '{expected}', got '{actual}'")]
    InvalidIssuer { expected: String, actual: String },

    #[error("Assertion audience does not include '{0}'")]
    InvalidAudience(String),

    #[error("Successful response carries no assertion")]
    MissingAssertion,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SamlError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            SamlError::Decode(_) => ErrorReason::DecodeError,
            SamlError::ReplayOrUnknownRequest(_) => ErrorReason::ReplayOrUnknownRequest,
            SamlError::InvalidSignature(_) => ErrorReason::InvalidSignature,
            SamlError::NoSignaturePresent(_) => ErrorReason::NoSignaturePresent,
            SamlError::UnknownKey(_) => ErrorReason::UnknownKey,
            SamlError::DecryptionFailed(_) => ErrorReason::DecryptionFailed,
            SamlError::ExpiredAssertion(_) => ErrorReason::ExpiredAssertion,
            SamlError::StatusDenied { .. } => ErrorReason::StatusDenied,
            SamlError::UntrustedTenant(_) => ErrorReason::UntrustedTenant,
            SamlError::DisabledClient(_) => ErrorReason::DisabledClient,
            SamlError::InvalidDestination { .. } => ErrorReason::InvalidDestination,
            SamlError::InvalidIssuer { .. } => ErrorReason::InvalidIssuer,
            SamlError::InvalidAudience(_) => ErrorReason::InvalidAudience,
            SamlError::MissingAssertion => ErrorReason::MissingAssertion,
            SamlError::Configuration(_) => ErrorReason::Configuration,
            SamlError::Internal(_) => ErrorReason::Internal,
        }
    }

    /// True for rejections caused by the message's cryptographic envelope.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self.reason(),
            ErrorReason::InvalidSignature | ErrorReason::NoSignaturePresent | ErrorReason::UnknownKey
        )
    }

    /// Log the rejection at `warn` and count it by reason.
    pub fn record_rejection(&self, tenant: Option<&str>) {
        let reason = self.reason();
        tracing::warn!(
            reason = reason.as_str(),
            tenant = tenant.unwrap_or("-"),
            error = %self,
            "SAML message rejected"
        );
        metrics::record_saml_rejection(reason.as_str());
    }

    fn status_code(&self) -> StatusCode {
        match self.reason() {
            ErrorReason::DecodeError | ErrorReason::ReplayOrUnknownRequest => {
                StatusCode::BAD_REQUEST
            }
            ErrorReason::InvalidSignature
            | ErrorReason::NoSignaturePresent
            | ErrorReason::UnknownKey
            | ErrorReason::DecryptionFailed
            | ErrorReason::ExpiredAssertion
            | ErrorReason::InvalidDestination
            | ErrorReason::InvalidIssuer
            | ErrorReason::InvalidAudience
            | ErrorReason::MissingAssertion => StatusCode::UNAUTHORIZED,
            ErrorReason::StatusDenied | ErrorReason::DisabledClient => StatusCode::FORBIDDEN,
            ErrorReason::UntrustedTenant => StatusCode::NOT_FOUND,
            ErrorReason::Configuration | ErrorReason::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<openssl::error::ErrorStack> for SamlError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SamlError::Internal(format!("OpenSSL error: {}", e))
    }
}

impl From<crate::session::SessionError> for SamlError {
    fn from(e: crate::session::SessionError) -> Self {
        SamlError::Internal(format!("Session store error: {}", e))
    }
}

/// Standard error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub code: String,
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let reason = self.reason();

        // Internal details stay in the logs
        let message = match reason {
            ErrorReason::Configuration | ErrorReason::Internal => {
                tracing::error!(error = %self, "SAML request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            error: ErrorInfo {
                error_type: "saml_error".to_string(),
                message,
                code: reason.as_str().to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(
            SamlError::ReplayOrUnknownRequest("x".into()).reason().as_str(),
            "REPLAY_OR_UNKNOWN_REQUEST"
        );
        assert_eq!(
            SamlError::NoSignaturePresent("response").reason().as_str(),
            "NO_SIGNATURE_PRESENT"
        );
        assert_eq!(
            serde_json::to_string(&ErrorReason::DecryptionFailed).unwrap(),
            "\"DECRYPTION_FAILED\""
        );
    }

    #[test]
    fn test_disabled_client_is_not_a_signature_failure() {
        let err = SamlError::DisabledClient("sales".into());
        assert!(!err.is_signature_failure());
        assert!(SamlError::InvalidSignature("digest".into()).is_signature_failure());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SamlError::Decode("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SamlError::InvalidSignature("bad".into())
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SamlError::UntrustedTenant("nope".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SamlError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
