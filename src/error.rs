//! Error types for Harbormaster

use thiserror::Error;

/// Main error type for Harbormaster operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A startup precondition was not met; the server cannot perform its
    /// function and must exit
    #[error("startup error: {0}")]
    Startup(String),

    /// Local configuration error
    #[error("config error: {0}")]
    Config(String),

    /// TLS key material error
    #[error("tls error: {0}")]
    Tls(String),

    /// Reverse proxy error
    #[error("proxy error: {0}")]
    Proxy(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a startup error with the given message
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Startup errors carry enough context for an operator to act on:
    /// they are the only errors that terminate the process, so the message
    /// is the last thing anyone sees.
    #[test]
    fn startup_errors_are_actionable() {
        let err = Error::startup("kubeconfig did not appear within 300s");
        assert!(err.to_string().contains("startup error"));
        assert!(err.to_string().contains("300s"));

        let err = Error::startup(format!("cannot bind port {}", 443));
        assert!(err.to_string().contains("443"));
    }

    /// Only startup-class failures are fatal; connectivity and proxy faults
    /// are recovered locally, so handlers need to tell them apart.
    #[test]
    fn errors_are_categorized_for_handling() {
        fn is_fatal(err: &Error) -> bool {
            matches!(err, Error::Startup(_) | Error::Tls(_) | Error::Config(_))
        }

        assert!(is_fatal(&Error::startup("no credentials file")));
        assert!(is_fatal(&Error::tls("key generation failed")));
        assert!(!is_fatal(&Error::proxy("backend unreachable")));
    }

    #[test]
    fn constructors_accept_str_and_string() {
        let err = Error::config("static message");
        assert!(err.to_string().contains("static message"));

        let home = "/opt/bundle";
        let err = Error::config(format!("missing local config under {}", home));
        assert!(err.to_string().contains("/opt/bundle"));
    }
}
