//! Error handling and display for the CLI.

use colored::Colorize;
use plfm_scheduler_k3s::SchedulerError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("k3s is not installed. Run `k3sctl initialize` first.")]
    NotInstalled,

    #[error("Invalid {what}: {value}")]
    InvalidArgument { what: &'static str, value: String },

    #[error("Job {job} failed")]
    JobFailed { job: String },
}

impl CliError {
    pub fn invalid(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            value: value.into(),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::JobFailed { .. } => Some("Inspect the job pod with `kubectl logs`."),
            _ => None,
        };
    }

    match err.downcast_ref::<SchedulerError>()? {
        SchedulerError::Unavailable(_) => {
            Some("Check that k3s is running and `kubeconfig-path` points at its kubeconfig.")
        }
        SchedulerError::PollTimeout { .. } => {
            Some("Raise the limit with `k3sctl set <app> deploy-timeout <duration>`.")
        }
        SchedulerError::RemoteOperation { .. } => {
            Some("Check ssh access to the host, or pass --insecure-allow-unknown-hosts.")
        }
        SchedulerError::Chart { .. } => Some("Run `helm history <release>` for details."),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hint_for_scheduler_timeout() {
        let err = anyhow::Error::new(SchedulerError::PollTimeout {
            resource: "pods".to_string(),
            elapsed: Duration::from_secs(300),
        });
        assert!(hint(&err).unwrap().contains("deploy-timeout"));
    }

    #[test]
    fn test_no_hint_for_plain_errors() {
        assert!(hint(&anyhow::anyhow!("boom")).is_none());
        assert!(hint(&anyhow::Error::new(CliError::NotInstalled)).is_none());
    }
}
