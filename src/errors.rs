use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AccessTokenRequired,
    JwtExpired,
    JwtNotYetValid,
    JwtInvalidSignature,
    JwtInvalidClient,
    JwtInvalidClaims,
    PublicKeyNotFound,

    SignatureRequired,
    RequestExpired,
    InvalidNonce,
    NonceReused,
    NonceLedgerSaturated,
    SignatureVerificationFailed,
    MalformedSignedMessage,
    InvalidRequestBody,

    AuthenticationError,
    RateLimitExceeded,
    EndpointNotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AccessTokenRequired => "ACCESS_TOKEN_REQUIRED",
            ErrorKind::JwtExpired => "JWT_EXPIRED",
            ErrorKind::JwtNotYetValid => "JWT_NOT_YET_VALID",
            ErrorKind::JwtInvalidSignature => "JWT_INVALID_SIGNATURE",
            ErrorKind::JwtInvalidClient => "JWT_INVALID_CLIENT",
            ErrorKind::JwtInvalidClaims => "JWT_INVALID_CLAIMS",
            ErrorKind::PublicKeyNotFound => "PUBLIC_KEY_NOT_FOUND",
            ErrorKind::SignatureRequired => "SIGNATURE_REQUIRED",
            ErrorKind::RequestExpired => "REQUEST_EXPIRED",
            ErrorKind::InvalidNonce => "INVALID_NONCE",
            ErrorKind::NonceReused => "NONCE_REUSED",
            ErrorKind::NonceLedgerSaturated => "NONCE_LEDGER_SATURATED",
            ErrorKind::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            ErrorKind::MalformedSignedMessage => "MALFORMED_SIGNED_MESSAGE",
            ErrorKind::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::EndpointNotFound => "ENDPOINT_NOT_FOUND",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.as_str() == code)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::AccessTokenRequired
            | ErrorKind::JwtExpired
            | ErrorKind::JwtNotYetValid
            | ErrorKind::JwtInvalidSignature
            | ErrorKind::JwtInvalidClient
            | ErrorKind::JwtInvalidClaims
            | ErrorKind::PublicKeyNotFound => StatusCode::UNAUTHORIZED,

            ErrorKind::SignatureRequired | ErrorKind::SignatureVerificationFailed => {
                StatusCode::FORBIDDEN
            }

            ErrorKind::RequestExpired
            | ErrorKind::InvalidNonce
            | ErrorKind::NonceReused
            | ErrorKind::MalformedSignedMessage
            | ErrorKind::InvalidRequestBody => StatusCode::BAD_REQUEST,

            ErrorKind::NonceLedgerSaturated => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::AuthenticationError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::EndpointNotFound => StatusCode::NOT_FOUND,
        }
    }
}

const ALL_KINDS: [ErrorKind; 18] = [
    ErrorKind::AccessTokenRequired,
    ErrorKind::JwtExpired,
    ErrorKind::JwtNotYetValid,
    ErrorKind::JwtInvalidSignature,
    ErrorKind::JwtInvalidClient,
    ErrorKind::JwtInvalidClaims,
    ErrorKind::PublicKeyNotFound,
    ErrorKind::SignatureRequired,
    ErrorKind::RequestExpired,
    ErrorKind::InvalidNonce,
    ErrorKind::NonceReused,
    ErrorKind::NonceLedgerSaturated,
    ErrorKind::SignatureVerificationFailed,
    ErrorKind::MalformedSignedMessage,
    ErrorKind::InvalidRequestBody,
    ErrorKind::AuthenticationError,
    ErrorKind::RateLimitExceeded,
    ErrorKind::EndpointNotFound,
];

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Bearer token required for API access")]
    AccessTokenRequired,
    #[error("Token has expired")]
    JwtExpired,
    #[error("Token not yet valid")]
    JwtNotYetValid,
    #[error("Invalid token signature")]
    JwtInvalidSignature,
    #[error("Token not issued for this client application")]
    JwtInvalidClient,
    #[error("Token claims invalid: {0}")]
    JwtInvalidClaims(&'static str),
    #[error("Token does not contain required public key for signature verification")]
    PublicKeyNotFound,

    #[error("Request timestamp is too old or invalid")]
    RequestExpired,
    #[error("Valid nonce is required (minimum 8 characters)")]
    InvalidNonce,
    #[error("Nonce has already been used")]
    NonceReused,
    #[error("Nonce ledger is at capacity, try again later")]
    NonceLedgerSaturated,
    #[error("Invalid signature")]
    SignatureVerificationFailed,
    #[error("Could not create signed message: {0}")]
    MalformedSignedMessage(String),
    #[error("Request body must be a JSON object")]
    InvalidRequestBody,

    #[error("Authentication required before signature validation")]
    AuthenticationError,
    #[error("Too many sensitive operations, try again later")]
    RateLimitExceeded,
    #[error("Endpoint {0} not found")]
    EndpointNotFound(String),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::AccessTokenRequired => ErrorKind::AccessTokenRequired,
            GateError::JwtExpired => ErrorKind::JwtExpired,
            GateError::JwtNotYetValid => ErrorKind::JwtNotYetValid,
            GateError::JwtInvalidSignature => ErrorKind::JwtInvalidSignature,
            GateError::JwtInvalidClient => ErrorKind::JwtInvalidClient,
            GateError::JwtInvalidClaims(_) => ErrorKind::JwtInvalidClaims,
            GateError::PublicKeyNotFound => ErrorKind::PublicKeyNotFound,
            GateError::RequestExpired => ErrorKind::RequestExpired,
            GateError::InvalidNonce => ErrorKind::InvalidNonce,
            GateError::NonceReused => ErrorKind::NonceReused,
            GateError::NonceLedgerSaturated => ErrorKind::NonceLedgerSaturated,
            GateError::SignatureVerificationFailed => ErrorKind::SignatureVerificationFailed,
            GateError::MalformedSignedMessage(_) => ErrorKind::MalformedSignedMessage,
            GateError::InvalidRequestBody => ErrorKind::InvalidRequestBody,
            GateError::AuthenticationError => ErrorKind::AuthenticationError,
            GateError::RateLimitExceeded => ErrorKind::RateLimitExceeded,
            GateError::EndpointNotFound(_) => ErrorKind::EndpointNotFound,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn from_error(err: &GateError) -> Self {
        Self {
            success: false,
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::from_error(&self))).into_response()
    }
}
