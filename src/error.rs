//! Error types for the OIDC provider.
//!
//! Two layers:
//!
//! - [`Error`] — internal faults (backing store, crypto, serialization).
//!   Logged server-side, never serialized to clients directly.
//! - [`OidcError`] — the protocol-level error vocabulary from RFC 6749 /
//!   OIDC Core, rendered as a `400` JSON body or an error redirect.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::store::StoreError;

/// Result type alias for internal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Internal provider errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing object store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Platform resource directory error
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Signing key material missing or malformed
    #[error("Signing key error: {0}")]
    SigningKey(String),

    /// JWT signing/verification error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Cryptographically secure random source failure
    #[error("Random source error: {0}")]
    Random(#[from] rand::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// OIDC standard error codes used as the external vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or semantically invalid request.
    InvalidRequest,
    /// The resource owner or the platform denied the request.
    AccessDenied,
    /// Only `response_type=code` is supported.
    UnsupportedResponseType,
    /// Scope outside the supported set, or `openid` missing.
    InvalidScope,
    /// Internal fault mapped to a generic server error.
    ServerError,
}

impl ErrorKind {
    /// The wire representation of the error code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::ServerError => "server_error",
        }
    }
}

/// JSON error body per RFC 6749 §5.2.
#[derive(Debug, Serialize, Deserialize)]
pub struct OidcErrorBody {
    /// Error code.
    pub error: String,
    /// Human-readable detail.
    pub error_description: String,
}

/// A protocol error destined for the client application.
#[derive(Debug)]
pub struct OidcError {
    /// Error code.
    pub kind: ErrorKind,
    /// Human-readable detail. Must not leak internal identifiers beyond
    /// what is already public.
    pub description: String,
}

impl OidcError {
    /// Create a protocol error.
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for OidcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.description)
    }
}

impl std::error::Error for OidcError {}

impl IntoResponse for OidcError {
    fn into_response(self) -> Response {
        let body = OidcErrorBody {
            error: self.kind.as_str().to_string(),
            error_description: self.description,
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}
