//! Remote node access over ssh and sftp.
//!
//! [`OpenSshExecutor`] drives the OpenSSH client binaries with the platform's
//! identity file. Every call is a fresh, non-interactive connection; there
//! are no retries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use super::local::CommandOutput;
use super::node::{mock_node, node_name_arg};
use crate::cluster_client::MockClusterClient;
use crate::error::{Result, SchedulerError};
use crate::shell;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity files tried in order.
pub const SSH_KEY_NAMES: &[&str] = &["id_ed25519", "id_rsa"];

/// `ssh://[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl RemoteHost {
    /// `[user@]host` as ssh expects it.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl FromStr for RemoteHost {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => SchedulerError::config(format!(
                "missing remote host ssh scheme in remote host: {raw}"
            )),
            other => SchedulerError::config(format!("failed to parse remote host: {other}")),
        })?;
        if url.scheme() != "ssh" {
            return Err(SchedulerError::config(format!(
                "invalid remote host scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SchedulerError::config(format!("missing host in remote host: {raw}")))?;

        Ok(Self {
            user: Some(url.username())
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_SSH_PORT),
        })
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh://{}:{}", self.destination(), self.port)
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub host: RemoteHost,
    /// Accept host keys not yet in `known_hosts`.
    pub allow_unknown_hosts: bool,
}

/// A command to run on a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Label used in errors.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub sudo: bool,
}

impl RemoteCommand {
    pub fn new<S: Into<String>>(name: &str, program: &str, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            sudo: false,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// The remote shell command line.
    pub fn command_line(&self) -> Result<String> {
        let mut words = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            words.push("sudo".to_string());
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().cloned());
        shell::join(&words)
    }
}

/// Remote command and file transfer.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, connection: &Connection, command: &RemoteCommand) -> Result<CommandOutput>;

    /// Copy a local file to `remote_path`.
    async fn upload(&self, connection: &Connection, local: &Path, remote_path: &str) -> Result<CommandOutput>;
}

/// Run `command` and fail unless it exits zero.
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    connection: &Connection,
    command: &RemoteCommand,
) -> Result<CommandOutput> {
    let output = executor.run(connection, command).await?;
    if output.success() {
        return Ok(output);
    }
    Err(SchedulerError::RemoteOperation {
        message: format!(
            "Invalid exit code from {} command over ssh: {}",
            command.name, output.exit_code
        ),
        stderr: output.stderr.trim().to_string(),
    })
}

/// Upload a file and fail unless sftp exits zero.
pub async fn upload_checked(
    executor: &dyn RemoteExecutor,
    connection: &Connection,
    local: &Path,
    remote_path: &str,
) -> Result<CommandOutput> {
    let output = executor.upload(connection, local, remote_path).await?;
    if output.success() {
        return Ok(output);
    }
    Err(SchedulerError::RemoteOperation {
        message: format!(
            "Invalid exit code from sftp command over ssh: {}",
            output.exit_code
        ),
        stderr: output.stderr.trim().to_string(),
    })
}

// =============================================================================
// OpenSSH
// =============================================================================

/// [`RemoteExecutor`] backed by the `ssh` and `sftp` binaries.
#[derive(Debug, Clone)]
pub struct OpenSshExecutor {
    key_dir: PathBuf,
}

impl OpenSshExecutor {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
        }
    }

    async fn key_path(&self) -> Result<PathBuf> {
        for name in SSH_KEY_NAMES {
            let path = self.key_dir.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
        }
        Err(SchedulerError::config(format!(
            "ssh key not found at {}/id_ed25519 or {}/id_rsa",
            self.key_dir.display(),
            self.key_dir.display()
        )))
    }

    /// Options shared by ssh and sftp.
    fn options(connection: &Connection, key: &Path) -> Vec<String> {
        let host_checking = if connection.allow_unknown_hosts {
            "accept-new"
        } else {
            "yes"
        };
        vec![
            "-i".to_string(),
            key.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("StrictHostKeyChecking={host_checking}"),
        ]
    }
}

fn collect(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn run(&self, connection: &Connection, command: &RemoteCommand) -> Result<CommandOutput> {
        let key = self.key_path().await?;
        let line = command.command_line()?;
        debug!(host = %connection.host, command = %line, "Running command over ssh");

        let output = Command::new("ssh")
            .args(Self::options(connection, &key))
            .args(["-p", &connection.host.port.to_string()])
            .arg(connection.host.destination())
            .arg("--")
            .arg(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SchedulerError::io(format!("Unable to call {} command over ssh", command.name), e)
            })?;
        Ok(collect(output))
    }

    async fn upload(&self, connection: &Connection, local: &Path, remote_path: &str) -> Result<CommandOutput> {
        let key = self.key_path().await?;
        debug!(host = %connection.host, local = %local.display(), remote = %remote_path, "Copying file over sftp");

        let mut child = Command::new("sftp")
            .args(Self::options(connection, &key))
            .args(["-P", &connection.host.port.to_string()])
            .args(["-b", "-"])
            .arg(connection.host.destination())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SchedulerError::io("Unable to call sftp command", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let batch = format!(
                "put {} {}\n",
                shell::quote(&local.display().to_string())?,
                shell::quote(remote_path)?
            );
            stdin
                .write_all(batch.as_bytes())
                .await
                .map_err(|e| SchedulerError::io("Unable to write sftp batch", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SchedulerError::io("Unable to wait for sftp command", e))?;
        Ok(collect(output))
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Records every step as a line (`ssh <host> <command>` or
/// `sftp <host> <local> <remote>`) and fails at a chosen step.
#[derive(Default)]
pub struct MockRemoteExecutor {
    steps: Mutex<Vec<String>>,
    fail_at: Option<(usize, i32, String)>,
    cluster: Option<Arc<MockClusterClient>>,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register joined nodes with an in-memory cluster.
    pub fn with_cluster(mut self, cluster: Arc<MockClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Exit non-zero on the zero-based `step`.
    pub fn fail_at(mut self, step: usize, code: i32, stderr: &str) -> Self {
        self.fail_at = Some((step, code, stderr.to_string()));
        self
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, line: String) -> CommandOutput {
        let Ok(mut steps) = self.steps.lock() else {
            return CommandOutput::default();
        };
        let index = steps.len();
        steps.push(line);
        match &self.fail_at {
            Some((step, code, stderr)) if *step == index => CommandOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: stderr.clone(),
            },
            _ => CommandOutput::default(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn run(&self, connection: &Connection, command: &RemoteCommand) -> Result<CommandOutput> {
        let output = self.record(format!(
            "ssh {} {}",
            connection.host.destination(),
            command.command_line()?
        ));
        if output.success() {
            if let (Some(cluster), Some(name)) = (&self.cluster, node_name_arg(&command.args)) {
                cluster.insert_node(mock_node(name, &[], &[]));
            }
        }
        Ok(output)
    }

    async fn upload(&self, connection: &Connection, local: &Path, remote_path: &str) -> Result<CommandOutput> {
        Ok(self.record(format!(
            "sftp {} {} {}",
            connection.host.destination(),
            local.display(),
            remote_path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ssh://root@10.0.0.2:2222", Some("root"), "10.0.0.2", 2222)]
    #[case("ssh://10.0.0.2", None, "10.0.0.2", 22)]
    #[case("ssh://deploy@node-1.example.com", Some("deploy"), "node-1.example.com", 22)]
    fn test_parse_remote_host(
        #[case] raw: &str,
        #[case] user: Option<&str>,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        let remote: RemoteHost = raw.parse().unwrap();
        assert_eq!(remote.user.as_deref(), user);
        assert_eq!(remote.host, host);
        assert_eq!(remote.port, port);
    }

    #[rstest]
    #[case("10.0.0.2", "missing remote host ssh scheme")]
    #[case("http://10.0.0.2", "invalid remote host scheme: http")]
    fn test_parse_remote_host_errors(#[case] raw: &str, #[case] message: &str) {
        let err = raw.parse::<RemoteHost>().unwrap_err();
        assert!(err.to_string().contains(message), "{err}");
    }

    #[test]
    fn test_remote_host_display() {
        let remote: RemoteHost = "ssh://root@10.0.0.2".parse().unwrap();
        assert_eq!(remote.to_string(), "ssh://root@10.0.0.2:22");
    }

    #[test]
    fn test_command_line_quotes_args() {
        let cmd = RemoteCommand::new("curl", "curl", ["-o", "/tmp/k3s installer.sh"]).sudo();
        assert_eq!(cmd.command_line().unwrap(), "sudo curl -o '/tmp/k3s installer.sh'");
    }

    #[tokio::test]
    async fn test_run_checked_reports_exit_code() {
        let executor = MockRemoteExecutor::new().fail_at(0, 100, "E: Unable to locate package\n");
        let connection = Connection {
            host: "ssh://root@10.0.0.2".parse().unwrap(),
            allow_unknown_hosts: false,
        };
        let err = run_checked(
            &executor,
            &connection,
            &RemoteCommand::new("apt-get install", "apt-get", ["-y", "install", "curl"]).sudo(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid exit code from apt-get install command over ssh: 100"
        );
        assert_eq!(err.stderr(), Some("E: Unable to locate package"));
        assert_eq!(executor.steps(), vec!["ssh root@10.0.0.2 sudo apt-get -y install curl"]);
    }

    #[tokio::test]
    async fn test_openssh_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let executor = OpenSshExecutor::new(dir.path());
        let connection = Connection {
            host: "ssh://root@10.0.0.2".parse().unwrap(),
            allow_unknown_hosts: true,
        };
        let err = executor
            .run(&connection, &RemoteCommand::new("true", "true", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ssh key not found"));
    }
}
