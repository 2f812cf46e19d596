//! Error types shared by the tunnel server and agent
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to find the offending
//! object or startup phase in the logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tunnel plumbing
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid option or input
    #[error("validation error for {field}: {message}")]
    Validation {
        /// The option or input that is invalid (e.g., "--cluster-name")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Tunnel server address could not be resolved
    #[error("discovery error for {namespace}/{service}: {message}")]
    Discovery {
        /// Namespace of the service being inspected
        namespace: String,
        /// Name of the service being inspected
        service: String,
        /// Description of what failed
        message: String,
    },

    /// A lifecycle hook failed
    #[error("hook error [{provider}/{phase}]: {message}")]
    Hook {
        /// Hook provider name (e.g., "tkestack")
        provider: String,
        /// Hook phase (e.g., "post-start-agent")
        phase: String,
        /// Description of what failed
        message: String,
    },

    /// Client configuration could not be built
    #[error("client configuration error [{context}]: {message}")]
    ClientConfig {
        /// Description of what failed
        message: String,
        /// Which client was being built (e.g., "kubeconfig", "apiserver")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "discovery", "startup")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a specific field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a discovery error for a service
    pub fn discovery(
        namespace: impl Into<String>,
        service: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Discovery {
            namespace: namespace.into(),
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a hook error
    pub fn hook(
        provider: impl Into<String>,
        phase: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Hook {
            provider: provider.into(),
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Create a client configuration error with context
    pub fn client_config(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClientConfig {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and client configuration errors need an operator fix.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Discovery { .. } => true,
            Error::Hook { .. } => false,
            Error::ClientConfig { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn story_operator_misconfiguration_is_not_retried() {
        let err = Error::validation("--cluster-name", "must not be empty");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "validation error for --cluster-name: must not be empty"
        );

        let err = Error::client_config("apiserver", "bad url");
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_transient_api_failures_are_retried() {
        assert!(Error::from(api_error(500)).is_retryable());
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(Error::from(api_error(429)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
    }

    #[test]
    fn test_discovery_error_is_retryable() {
        let err = Error::discovery("kube-system", "x-tunnel-server-svc", "no cluster IP");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("kube-system/x-tunnel-server-svc"));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(!Error::from(api_error(500)).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_hook_error_display() {
        let err = Error::hook("tkestack", "post-start-agent", "patch failed");
        assert_eq!(
            err.to_string(),
            "hook error [tkestack/post-start-agent]: patch failed"
        );
    }

    #[test]
    fn test_internal_defaults_context() {
        match Error::internal("boom") {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
