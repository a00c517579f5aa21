//! Error kinds shared by the VAU transport, the HSM layer and the VSDM codec.
//!
//! Every failure carries a kind that decides its HTTP status. Client-caused
//! input errors map to 4xx, HSM and internal faults map to 5xx. Detail strings
//! are meant for the server log only; callers that answer a remote peer use
//! [`VauError::public_message`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP status codes the transport layer can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpStatus {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    InternalServerError,
}

impl HttpStatus {
    pub fn code(&self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::BadRequest => 400,
            HttpStatus::Unauthorized => 401,
            HttpStatus::Forbidden => 403,
            HttpStatus::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Unauthorized => "Unauthorized",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::InternalServerError => "Internal Server Error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code())
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(HttpStatus::Ok),
            400 => Some(HttpStatus::BadRequest),
            401 => Some(HttpStatus::Unauthorized),
            403 => Some(HttpStatus::Forbidden),
            500 => Some(HttpStatus::InternalServerError),
            _ => None,
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Errors of the VAU core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VauError {
    /// Malformed binary envelope
    #[error("Format error: {0}")]
    Format(String),

    /// AES-GCM authentication failure or cipher misuse
    #[error("AEAD error: {0}")]
    Aead(String),

    /// Semantic violation of a sub-protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request rejected by policy (VSDM proof checks)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// HSM connection or call failure
    #[error("HSM unavailable: {0}")]
    HsmUnavailable(String),

    /// The HSM dropped the session; a reconnect may help
    #[error("HSM session expired: {0}")]
    HsmSessionExpired(String),

    /// The peer key does not match the curve of the ECIES key pair
    #[error("ECIES curve mismatch")]
    EciesCurveMismatch,

    /// A health check failed
    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal fault
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VauError>;

impl VauError {
    /// The HTTP status this error is surfaced with
    pub fn status(&self) -> HttpStatus {
        match self {
            VauError::Format(_) | VauError::Aead(_) | VauError::Protocol(_) => HttpStatus::BadRequest,
            VauError::Forbidden(_) => HttpStatus::Forbidden,
            VauError::HsmUnavailable(_)
            | VauError::HsmSessionExpired(_)
            | VauError::EciesCurveMismatch
            | VauError::Unhealthy(_)
            | VauError::Config(_)
            | VauError::Internal(_) => HttpStatus::InternalServerError,
        }
    }

    /// True for recoverable errors caused by client input
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// True for failures of the HSM itself (as opposed to bad input)
    pub fn is_hsm_fault(&self) -> bool {
        matches!(
            self,
            VauError::HsmUnavailable(_) | VauError::HsmSessionExpired(_)
        )
    }

    /// Fixed text that is safe to hand to a remote peer
    pub fn public_message(&self) -> &'static str {
        match self {
            VauError::Format(_) => "malformed request envelope",
            VauError::Aead(_) => "request could not be decrypted",
            VauError::Protocol(_) => "invalid request",
            VauError::Forbidden(_) => "access denied",
            _ => "internal server error",
        }
    }

    /// Turn a client-class error into an internal one.
    ///
    /// Used where a failure cannot have been caused by the peer, e.g. when
    /// encrypting a response with a key we already accepted.
    pub fn into_internal(self) -> VauError {
        if self.is_client_error() {
            VauError::Internal(self.to_string())
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(VauError::Format("x".into()).status(), HttpStatus::BadRequest);
        assert_eq!(VauError::Aead("x".into()).status(), HttpStatus::BadRequest);
        assert_eq!(VauError::Protocol("x".into()).status(), HttpStatus::BadRequest);
        assert_eq!(VauError::Forbidden("x".into()).status(), HttpStatus::Forbidden);
        assert_eq!(
            VauError::HsmUnavailable("x".into()).status(),
            HttpStatus::InternalServerError
        );
        assert!(VauError::Protocol("x".into()).is_client_error());
        assert!(!VauError::Internal("x".into()).is_client_error());
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = VauError::Aead("openssl said something very specific".into());
        assert!(!err.public_message().contains("openssl"));
    }

    #[test]
    fn test_into_internal() {
        let err = VauError::Aead("tag".into()).into_internal();
        assert_eq!(err.status(), HttpStatus::InternalServerError);
        let err = VauError::HsmUnavailable("down".into()).into_internal();
        assert!(err.is_hsm_fault());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HttpStatus::Forbidden.to_string(), "403 Forbidden");
    }
}
