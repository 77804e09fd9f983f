//! Readiness waiter.
//!
//! Pods are first looked up by selector with a short existence backoff, then
//! polled until they run, terminate or the deadline passes. Time only moves
//! through the injected [`Clock`].

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::cluster_client::{ClusterClient, ExecRequest};
use crate::error::{Result, SchedulerError};
use crate::manifest::{BUILDER_TYPE_ANNOTATION, DEFAULT_CONTAINER_ANNOTATION, NAME_LABEL, PART_OF_LABEL};
use crate::manifest::job::HEROKUISH_EXEC;
use crate::manifest::ImageSourceType;

/// Listings tried before giving up on finding pods.
pub const EXISTENCE_ATTEMPTS: u32 = 3;

/// How long `enter` waits for the pod.
pub const ENTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Shell used when entering without a command.
pub const DEFAULT_SHELL: &str = "/bin/bash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForPodInput {
    pub namespace: String,
    pub label_selector: String,
    /// Only wait for this pod.
    pub pod_name: Option<String>,
    pub timeout: Duration,
    /// Treat `Succeeded`/`Failed` as done rather than an error.
    pub allow_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterPodInput {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    /// Command to run. Empty opens `shell`.
    pub command: Vec<String>,
    pub shell: Option<String>,
    pub tty: bool,
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

pub struct ReadinessWaiter {
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(client: Arc<dyn ClusterClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// List pods matching `selector`, retrying while none exist.
    async fn find_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        for attempt in 1..=EXISTENCE_ATTEMPTS {
            let pods = self.client.list_pods(namespace, selector).await?;
            if !pods.is_empty() {
                return Ok(pods);
            }
            debug!(namespace = %namespace, selector = %selector, attempt, "No pods yet");
            if attempt < EXISTENCE_ATTEMPTS {
                self.clock.sleep(Duration::from_secs(1)).await;
            }
        }
        Err(SchedulerError::NoPods {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
        })
    }

    /// Wait until every matching pod is running.
    pub async fn wait_for_pod_running(&self, input: &WaitForPodInput) -> Result<()> {
        let pods = self.find_pods(&input.namespace, &input.label_selector).await?;
        let candidates: Vec<String> = match &input.pod_name {
            Some(name) => vec![name.clone()],
            None => pods.iter().filter_map(|p| p.metadata.name.clone()).collect(),
        };

        let start = self.clock.now();
        for name in candidates {
            loop {
                let pod = self.client.get_pod(&input.namespace, &name).await?;
                match phase(&pod) {
                    "Running" => {
                        debug!(pod = %name, "Pod is running");
                        break;
                    }
                    terminal @ ("Succeeded" | "Failed") => {
                        if input.allow_completion {
                            break;
                        }
                        return Err(SchedulerError::TerminalPod {
                            pod: name,
                            phase: terminal.to_string(),
                        });
                    }
                    _ => {}
                }

                let elapsed = self.clock.now().saturating_duration_since(start);
                if elapsed >= input.timeout {
                    return Err(SchedulerError::PollTimeout {
                        resource: format!("pod {name}"),
                        elapsed,
                    });
                }
                self.clock.sleep(self.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Wait for a pod to reach a terminal phase, returning it.
    pub async fn wait_for_completion(&self, namespace: &str, pod: &str, timeout: Duration) -> Result<String> {
        let start = self.clock.now();
        loop {
            let current = self.client.get_pod(namespace, pod).await?;
            let phase = phase(&current);
            if matches!(phase, "Succeeded" | "Failed") {
                return Ok(phase.to_string());
            }
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                return Err(SchedulerError::PollTimeout {
                    resource: format!("pod {pod}"),
                    elapsed,
                });
            }
            self.clock.sleep(self.poll_interval).await;
        }
    }

    /// Pick a pod of `app` by name or by `<process type>[.<index>]`.
    pub async fn select_pod(&self, namespace: &str, app: &str, target: &str) -> Result<Pod> {
        let selector = format!("{PART_OF_LABEL}={app}");
        let pods = self.client.list_pods(namespace, &selector).await?;
        if pods.is_empty() {
            return Err(SchedulerError::NoPods {
                namespace: namespace.to_string(),
                selector,
            });
        }

        if let Some(pod) = pods.iter().find(|p| p.metadata.name.as_deref() == Some(target)) {
            return Ok(pod.clone());
        }

        let (process_type, index) = parse_process_selector(target)?;
        let mut matching: Vec<&Pod> = pods
            .iter()
            .filter(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(NAME_LABEL))
                    .map(String::as_str)
                    == Some(process_type.as_str())
            })
            .collect();
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        if matching.is_empty() {
            return Err(SchedulerError::config(format!(
                "No pods found for process type {process_type}"
            )));
        }
        matching
            .get(index - 1)
            .map(|p| (*p).clone())
            .ok_or_else(|| {
                SchedulerError::config(format!(
                    "Index {index} out of range for process type {process_type} ({} running)",
                    matching.len()
                ))
            })
    }

    /// Exec into a pod once it runs.
    pub async fn enter_pod(&self, input: &EnterPodInput) -> Result<()> {
        let pod = self.client.get_pod(&input.namespace, &input.pod).await?;
        let selector = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PART_OF_LABEL))
            .map(|app| format!("{PART_OF_LABEL}={app}"))
            .unwrap_or_default();

        self.wait_for_pod_running(&WaitForPodInput {
            namespace: input.namespace.clone(),
            label_selector: selector,
            pod_name: Some(input.pod.clone()),
            timeout: ENTER_TIMEOUT,
            allow_completion: false,
        })
        .await?;

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let container = input
            .container
            .clone()
            .or_else(|| annotations.get(DEFAULT_CONTAINER_ANNOTATION).cloned())
            .ok_or_else(|| {
                SchedulerError::config("No container specified and no default container found")
            })?;

        let mut command = Vec::new();
        if annotations.get(BUILDER_TYPE_ANNOTATION).map(String::as_str)
            == Some(ImageSourceType::Herokuish.as_str())
        {
            command.push(HEROKUISH_EXEC.to_string());
        }
        if input.command.is_empty() {
            command.push(input.shell.clone().unwrap_or_else(|| DEFAULT_SHELL.to_string()));
        } else {
            command.extend(input.command.iter().cloned());
        }

        info!(pod = %input.pod, container = %container, "Entering pod");
        self.client
            .exec(&ExecRequest {
                namespace: input.namespace.clone(),
                pod: input.pod.clone(),
                container,
                command,
                tty: input.tty,
            })
            .await
    }
}

/// Parse `web` or `web.2` into a process type and 1-based index.
pub fn parse_process_selector(raw: &str) -> Result<(String, usize)> {
    let (process_type, index) = match raw.rsplit_once('.') {
        Some((process_type, index)) => {
            let index = index
                .parse::<usize>()
                .ok()
                .filter(|&i| i > 0)
                .ok_or_else(|| SchedulerError::config(format!("Invalid process index in {raw}")))?;
            (process_type, index)
        }
        None => (raw, 1),
    };
    if process_type.is_empty() {
        return Err(SchedulerError::config(format!("Invalid process selector {raw}")));
    }
    Ok((process_type.to_string(), index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster_client::{mock_pod, MockClusterClient};
    use rstest::rstest;

    fn waiter(client: Arc<MockClusterClient>, clock: Arc<ManualClock>) -> ReadinessWaiter {
        ReadinessWaiter::new(client, clock)
    }

    fn wait_input(timeout: u64) -> WaitForPodInput {
        WaitForPodInput {
            namespace: "default".into(),
            label_selector: "app.kubernetes.io/part-of=foo".into(),
            pod_name: None,
            timeout: Duration::from_secs(timeout),
            allow_completion: false,
        }
    }

    fn foo_pod(name: &str, process_type: &str, phase: &str) -> Pod {
        mock_pod(
            name,
            &[(PART_OF_LABEL, "foo"), (NAME_LABEL, process_type)],
            &[(DEFAULT_CONTAINER_ANNOTATION, "foo-web"), (BUILDER_TYPE_ANNOTATION, "herokuish")],
            phase,
        )
    }

    #[tokio::test]
    async fn test_pending_then_running() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-1", "web", "Pending"));
        client.set_pod_phases("default", "foo-web-1", &["Pending", "Pending", "Running"]);
        let clock = Arc::new(ManualClock::default());

        waiter(client, clock.clone()).wait_for_pod_running(&wait_input(30)).await.unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-1", "web", "Failed"));
        let clock = Arc::new(ManualClock::default());

        let err = waiter(client.clone(), clock.clone())
            .wait_for_pod_running(&wait_input(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TerminalPod { ref phase, .. } if phase == "Failed"));

        let mut input = wait_input(30);
        input.allow_completion = true;
        waiter(client, clock).wait_for_pod_running(&input).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_until_deadline() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-1", "web", "Pending"));
        let clock = Arc::new(ManualClock::default());

        let err = waiter(client, clock.clone())
            .wait_for_pod_running(&wait_input(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_existence_retries() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-1", "web", "Running"));
        client.hide_pods_for(2);
        let clock = Arc::new(ManualClock::default());
        waiter(client.clone(), clock.clone())
            .wait_for_pod_running(&wait_input(5))
            .await
            .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(2));

        client.hide_pods_for(3);
        let err = waiter(client, clock).wait_for_pod_running(&wait_input(5)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoPods { .. }));
    }

    #[rstest]
    #[case("web", "web", 1)]
    #[case("web.2", "web", 2)]
    #[case("worker.10", "worker", 10)]
    fn test_parse_process_selector(#[case] raw: &str, #[case] process_type: &str, #[case] index: usize) {
        assert_eq!(parse_process_selector(raw).unwrap(), (process_type.to_string(), index));
    }

    #[rstest]
    #[case("web.0")]
    #[case("web.x")]
    #[case(".1")]
    fn test_parse_process_selector_invalid(#[case] raw: &str) {
        assert!(parse_process_selector(raw).is_err());
    }

    #[tokio::test]
    async fn test_select_pod() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-b", "web", "Running"));
        client.insert_pod("default", foo_pod("foo-web-a", "web", "Running"));
        client.insert_pod("default", foo_pod("foo-worker-a", "worker", "Running"));
        let w = waiter(client, Arc::new(ManualClock::default()));

        let pod = w.select_pod("default", "foo", "web.2").await.unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("foo-web-b"));
        let pod = w.select_pod("default", "foo", "foo-worker-a").await.unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("foo-worker-a"));
        assert!(w.select_pod("default", "foo", "web.3").await.is_err());
        assert!(w.select_pod("default", "bar", "web").await.is_err());
    }

    #[tokio::test]
    async fn test_enter_pod_herokuish() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", foo_pod("foo-web-a", "web", "Running"));
        let w = waiter(client.clone(), Arc::new(ManualClock::default()));

        w.enter_pod(&EnterPodInput {
            namespace: "default".into(),
            pod: "foo-web-a".into(),
            container: None,
            command: vec![],
            shell: Some("/bin/sh".into()),
            tty: true,
        })
        .await
        .unwrap();

        let requests = client.exec_requests();
        assert_eq!(requests[0].container, "foo-web");
        assert_eq!(requests[0].command, vec!["/exec", "/bin/sh"]);
    }

    #[tokio::test]
    async fn test_enter_pod_without_container() {
        let client = Arc::new(MockClusterClient::new());
        client.insert_pod("default", mock_pod("foo-web-a", &[(PART_OF_LABEL, "foo")], &[], "Running"));
        let w = waiter(client, Arc::new(ManualClock::default()));

        let err = w
            .enter_pod(&EnterPodInput {
                namespace: "default".into(),
                pod: "foo-web-a".into(),
                container: None,
                command: vec!["ls".into()],
                shell: None,
                tty: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No container specified and no default container found");
    }
}
