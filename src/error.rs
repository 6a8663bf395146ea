//! Error types for consul-sync
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the service or object it concerns so that a joined sync
//! error still reads as a list of concrete, actionable failures.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for consul-sync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Consul could not be reached, answered with a non-2xx status, or sent
    /// a body that failed to decode
    #[error("consul unavailable{}: {message}", .service.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default())]
    Registry {
        /// Description of what failed
        message: String,
        /// Service being fetched, if the failure was service-specific
        service: Option<String>,
    },

    /// A registry service cannot be projected (bad port, unusable name)
    #[error("invalid service data for {service}: {message}")]
    InvalidServiceData {
        /// Registry service name
        service: String,
        /// Description of what's invalid
        message: String,
    },

    /// Server-side apply of a single object failed
    #[error("applying {kind} {name}: {source}")]
    Apply {
        /// Object kind (Service, EndpointSlice, HTTPRoute)
        kind: &'static str,
        /// Object name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Deleting a single managed object failed
    #[error("deleting {kind} {name}: {source}")]
    Delete {
        /// Object kind (Service, EndpointSlice, HTTPRoute)
        kind: &'static str,
        /// Object name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// All failures of one sync cycle, in the order they happened
    #[error("sync finished with {} error(s): {}", .errors.len(), join_messages(.errors))]
    Sync {
        /// Individual failures
        errors: Vec<Error>,
    },

    /// Invalid process configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watcher", "reconciler")
        context: String,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry {
            message: msg.into(),
            service: None,
        }
    }

    /// Create a registry error for a specific service
    pub fn registry_for(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registry {
            message: msg.into(),
            service: Some(service.into()),
        }
    }

    /// Create an invalid service data error
    pub fn invalid_service(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidServiceData {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Wrap a failure to apply an object
    pub fn apply(kind: &'static str, name: impl Into<String>, source: Error) -> Self {
        Self::Apply {
            kind,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failure to delete an object
    pub fn delete(kind: &'static str, name: impl Into<String>, source: Error) -> Self {
        Self::Delete {
            kind,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Join cycle errors; `None` when nothing failed
    pub fn join(errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self::Sync { errors })
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Whether the Kubernetes API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}
