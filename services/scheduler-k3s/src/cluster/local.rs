//! Commands run on the scheduler host.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::node::{mock_node, node_name_arg};
use crate::cluster_client::MockClusterClient;
use crate::error::{Result, SchedulerError};

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs programs on the local host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Fail with `Invalid exit code from <name> command: <n>` unless the command succeeded.
pub fn check_local(name: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(SchedulerError::CommandFailed {
        message: format!(
            "Invalid exit code from {name} command: {}",
            output.exit_code
        ),
        stderr: output.stderr.trim().to_string(),
    })
}

/// [`CommandRunner`] that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SchedulerError::io(format!("Unable to call {program} command"), e))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Records every invocation. Programs can be scripted to fail, and installer
/// runs register the joined node with an in-memory cluster.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<Vec<String>>>,
    failures: Vec<(String, i32, String)>,
    cluster: Option<Arc<MockClusterClient>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster: Arc<MockClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Exit with `code` when the command line contains `needle`.
    pub fn fail_on(mut self, needle: &str, code: i32, stderr: &str) -> Self {
        self.failures
            .push((needle.to_string(), code, stderr.to_string()));
        self
    }

    /// Command lines run so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut line = vec![program.to_string()];
        line.extend(args.iter().cloned());
        let joined = line.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }

        if let Some((_, code, stderr)) = self.failures.iter().find(|(n, _, _)| joined.contains(n.as_str())) {
            return Ok(CommandOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        if let (Some(cluster), Some(name)) = (&self.cluster, node_name_arg(args)) {
            cluster.insert_node(mock_node(
                name,
                &[("node-role.kubernetes.io/control-plane", "true")],
                &[],
            ));
        }
        Ok(CommandOutput::default())
    }
}
