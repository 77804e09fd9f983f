//! Error types for the k3s scheduler.

use std::io;
use std::time::Duration;

use plfm_properties::PropertyError;
use thiserror::Error;

/// Result alias used throughout the scheduler.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid settings or input.
    #[error("{0}")]
    Configuration(String),

    /// A command on a remote node failed.
    #[error("{message}")]
    RemoteOperation { message: String, stderr: String },

    /// A local command exited non-zero.
    #[error("{message}")]
    CommandFailed { message: String, stderr: String },

    /// A chart could not be located, loaded or applied.
    #[error("{message}")]
    Chart { release: String, message: String },

    /// Polling gave up.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    PollTimeout { resource: String, elapsed: Duration },

    /// A pod stopped before reaching the running phase.
    #[error("pod {pod} reached terminal phase {phase}")]
    TerminalPod { pod: String, phase: String },

    /// The Kubernetes API is not reachable.
    #[error("kubernetes api not available: {0}")]
    Unavailable(String),

    /// Operation interrupted by a shutdown signal.
    #[error("{0} has been cancelled")]
    Cancelled(String),

    /// No pods matched a selector.
    #[error("no pods found in namespace {namespace} matching {selector}")]
    NoPods { namespace: String, selector: String },

    /// Object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Kubernetes API error.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// Property store error.
    #[error(transparent)]
    Property(#[from] PropertyError),

    /// IO error with the path or command involved.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// YAML encoding error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A collaborator (config, certs, procfile, ...) failed.
    #[error("{0}")]
    Provider(String),
}

impl SchedulerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn path_io(path: &std::path::Path, source: io::Error) -> Self {
        Self::io(path.display().to_string(), source)
    }

    pub(crate) fn chart(release: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Chart {
            release: release.into(),
            message: message.into(),
        }
    }

    /// Returns true if the Kubernetes API could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }

    /// Returns true if polling timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SchedulerError::PollTimeout { .. })
    }

    /// Returns true if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled(_))
    }

    /// Returns true for missing objects, including Kubernetes 404 responses.
    pub fn is_not_found(&self) -> bool {
        match self {
            SchedulerError::NotFound(_) => true,
            SchedulerError::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Captured stderr of a failed remote command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            SchedulerError::RemoteOperation { stderr, .. }
            | SchedulerError::CommandFailed { stderr, .. }
                if !stderr.is_empty() =>
            {
                Some(stderr)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(SchedulerError::Unavailable("refused".into()).is_unavailable());
        assert!(SchedulerError::Cancelled("Deployment of foo".into()).is_cancelled());
        assert!(SchedulerError::PollTimeout {
            resource: "pod foo-web-1".into(),
            elapsed: Duration::from_secs(3),
        }
        .is_timeout());
        assert!(SchedulerError::NotFound("secret tls-foo".into()).is_not_found());
        assert!(!SchedulerError::config("bad").is_timeout());
    }

    #[test]
    fn test_remote_operation_keeps_stderr() {
        let err = SchedulerError::RemoteOperation {
            message: "Invalid exit code from apt-get command over ssh: 100".into(),
            stderr: "E: Unable to locate package".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid exit code from apt-get command over ssh: 100"
        );
        assert_eq!(err.stderr(), Some("E: Unable to locate package"));
    }

    #[test]
    fn test_cancelled_message() {
        let err = SchedulerError::Cancelled("Deployment of foo".into());
        assert_eq!(err.to_string(), "Deployment of foo has been cancelled");
    }
}
