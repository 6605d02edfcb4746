//! Error taxonomy and wire failure payloads

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::supervisor::ServiceError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the configuration store, the dispatcher, the
/// listeners and the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Permission(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ServiceError),
}

/// Machine-readable error kind, carried on the wire next to the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Permission,
    Io,
    Serialization,
    TlsConfig,
    Bind,
    Process,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Permission => "permission",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::TlsConfig => "tls_config",
            ErrorKind::Bind => "bind",
            ErrorKind::Process => "process",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Permission(_) => ErrorKind::Permission,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::TlsConfig(_) => ErrorKind::TlsConfig,
            Error::Bind { .. } => ErrorKind::Bind,
            Error::Process(_) => ErrorKind::Process,
        }
    }

    /// HTTP status reported alongside this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Permission(_) => StatusCode::FORBIDDEN,
            Error::Io(_) | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TlsConfig(_) => StatusCode::BAD_REQUEST,
            Error::Bind { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Process(ServiceError::Spawn { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Process(_) => StatusCode::CONFLICT,
        }
    }

    pub fn failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Failure half of the tagged RPC result
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Tagged RPC result: `{"ok": value}` or `{"error": {"kind", "message"}}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(serde_json::Value),
    Error(Failure),
}

impl Outcome {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| match self {
            Outcome::Ok(_) => r#"{"ok":null}"#.to_string(),
            Outcome::Error(failure) => format!(
                r#"{{"error":{{"kind":"{}","message":"{}"}}}}"#,
                failure.kind.as_str(),
                failure.message.replace('\"', "\\\"")
            ),
        })
    }
}

/// Plain-text response with the given status, as written back to proxied
/// callers when a backend round-trip cannot be made
pub fn text_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Permission("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::Process(ServiceError::NotRunning).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_outcome_is_tagged() {
        let ok = Outcome::Ok(serde_json::json!(true)).to_json();
        assert_eq!(ok, r#"{"ok":true}"#);

        let err = Outcome::Error(Error::NotFound("Service not found.".into()).failure()).to_json();
        assert!(err.contains("\"kind\":\"not_found\""));
        assert!(err.contains("\"message\":\"Service not found.\""));
    }

    #[test]
    fn test_bind_error_message_names_port() {
        let err = Error::Bind {
            port: 8443,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.kind(), ErrorKind::Bind);
        assert!(err.to_string().contains("8443"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::INTERNAL_SERVER_ERROR, "backend down");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
