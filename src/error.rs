//! Error taxonomy, exit codes and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

/// Fatal errors raised while starting or running the proxy.
///
/// Request-scoped failures never surface here; the dispatcher turns them
/// into a [`json_error_response`] for the caller that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The manifest is missing, unreadable, unparsable or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A forwarding channel could not be started
    #[error("failed to start forwarding channel for {hostname}: {source}")]
    ForwardingSpawn {
        hostname: String,
        #[source]
        source: std::io::Error,
    },

    /// Startup was aborted because shutdown had already begun
    #[error("shutdown in progress, refusing to start {hostname}")]
    ShutdownInProgress { hostname: String },

    /// The hosts file could not be read or written
    #[error("hosts file {}: {source}", path.display())]
    HostsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The serving socket failed
    #[error("listener error on {addr}: {source}")]
    Listener {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// The process exit status this error maps to
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::Config(_) => ExitStatus::ConfigFailure,
            Error::ForwardingSpawn { .. } | Error::ShutdownInProgress { .. } | Error::HostsFile { .. } => {
                ExitStatus::StartupFailure
            }
            Error::Listener { .. } => ExitStatus::RuntimeFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit status, one per trigger class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean exit (listener stopped without error)
    Success,
    /// Manifest missing or invalid
    ConfigFailure,
    /// A forwarding channel or the hosts file failed during startup
    StartupFailure,
    /// The listener failed while serving
    RuntimeFailure,
    /// Shutdown requested by a termination signal
    Signal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ConfigFailure => 1,
            ExitStatus::StartupFailure => 2,
            ExitStatus::RuntimeFailure => 3,
            ExitStatus::Signal => 130,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

/// Error codes for request-scoped proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route for the requested hostname
    UnknownHost,
    /// The outbound request could not be built
    InvalidUpstreamRequest,
    /// Connecting to or exchanging with the upstream failed
    UpstreamUnavailable,
    /// The upstream did not answer within the request timeout
    UpstreamTimeout,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InvalidUpstreamRequest => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamTimeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::InvalidUpstreamRequest => "INVALID_UPSTREAM_REQUEST",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "code": self.code.as_header_value(),
            "message": self.message,
            "status": self.status,
        })
        .to_string()
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::UnknownHost.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::UpstreamTimeout.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "No route for example.local");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"No route for example.local\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::UpstreamTimeout, "timed out");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_TIMEOUT"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct_per_trigger_class() {
        let codes = [
            ExitStatus::ConfigFailure.code(),
            ExitStatus::StartupFailure.code(),
            ExitStatus::RuntimeFailure.code(),
            ExitStatus::Signal.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(ExitStatus::Success.code(), 0);
    }

    #[test]
    fn test_error_exit_status_mapping() {
        assert_eq!(Error::config("bad").exit_status(), ExitStatus::ConfigFailure);

        let spawn = Error::ForwardingSpawn {
            hostname: "api.local".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "kubectl"),
        };
        assert_eq!(spawn.exit_status(), ExitStatus::StartupFailure);
        assert!(spawn.to_string().contains("api.local"));

        let listener = Error::Listener {
            addr: "127.0.0.1:80".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(listener.exit_status(), ExitStatus::RuntimeFailure);
    }
}
