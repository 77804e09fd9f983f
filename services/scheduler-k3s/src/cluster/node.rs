//! Cluster node view and role labels.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node as KubeNode;
use serde::Serialize;
use serde_json::json;

use crate::error::{Result, SchedulerError};

pub const ROLE_LABEL: &str = "kubernetes.io/role";
pub const NODE_ROLE_PREFIX: &str = "node-role.kubernetes.io/";
pub const REMOTE_HOST_ANNOTATION: &str = "plfm.dev/remote-host";

/// Labels applied to server nodes so the service load balancer runs on them.
pub const SERVER_LABELS: &[(&str, &str)] = &[("svccontroller.k3s.cattle.io/enablelb", "true")];

/// Labels applied to worker nodes.
pub const WORKER_LABELS: &[(&str, &str)] = &[("node-role.kubernetes.io/worker", "worker")];

/// Role a joining node takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Server,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Server => "server",
            NodeRole::Worker => "worker",
        }
    }

    pub fn labels(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            NodeRole::Server => SERVER_LABELS,
            NodeRole::Worker => WORKER_LABELS,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(NodeRole::Server),
            "worker" => Ok(NodeRole::Worker),
            other => Err(SchedulerError::config(format!("Invalid server-type: {other}"))),
        }
    }
}

/// What `cluster list` shows for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: String,
    pub roles: Vec<String>,
    pub ready: bool,
    pub remote_host: Option<String>,
    pub version: String,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.name,
            self.ready,
            self.roles.join(","),
            self.version
        )
    }
}

impl From<&KubeNode> for Node {
    fn from(node: &KubeNode) -> Self {
        let labels = node.metadata.labels.clone().unwrap_or_default();

        let mut roles: Vec<String> = match labels.get(ROLE_LABEL).filter(|r| !r.is_empty()) {
            Some(role) => vec![role.clone()],
            None => labels
                .iter()
                .filter(|(_, v)| v.as_str() == "true")
                .filter_map(|(k, _)| k.strip_prefix(NODE_ROLE_PREFIX))
                .map(str::to_string)
                .collect(),
        };
        roles.sort();
        roles.dedup();

        let status = node.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
            .map(|c| c.status == "True")
            .unwrap_or(false);

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            roles,
            ready,
            remote_host: node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REMOTE_HOST_ANNOTATION))
                .cloned(),
            version: status
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.kubelet_version.clone())
                .unwrap_or_default(),
        }
    }
}

/// A ready node object, for in-memory clusters.
pub fn mock_node(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> KubeNode {
    let to_map = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect::<serde_json::Map<String, serde_json::Value>>()
    };
    let node = json!({
        "metadata": {
            "name": name,
            "labels": to_map(labels),
            "annotations": to_map(annotations),
        },
        "status": {
            "conditions": [{"type": "Ready", "status": "True"}],
            "nodeInfo": {
                "architecture": "amd64",
                "bootID": "",
                "containerRuntimeVersion": "containerd://1.7.11-k3s2",
                "kernelVersion": "6.1.0",
                "kubeProxyVersion": "v1.30.2+k3s1",
                "kubeletVersion": "v1.30.2+k3s1",
                "machineID": "",
                "operatingSystem": "linux",
                "osImage": "Debian GNU/Linux 12",
                "systemUUID": "",
            },
        },
    });
    serde_json::from_value(node).unwrap_or_default()
}

/// The `--node-name` value of an installer invocation.
pub(crate) fn node_name_arg(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--node-name")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[("node-role.kubernetes.io/server", "true"), ("node-role.kubernetes.io/master", "true")], vec!["master", "server"])]
    #[case(&[("kubernetes.io/role", "worker"), ("node-role.kubernetes.io/master", "true")], vec!["worker"])]
    #[case(&[("kubernetes.io/role", ""), ("node-role.kubernetes.io/etcd", "true")], vec!["etcd"])]
    #[case(&[("node-role.kubernetes.io/worker", "worker")], vec![])]
    fn test_roles(#[case] labels: &[(&str, &str)], #[case] expected: Vec<&str>) {
        let node = Node::from(&mock_node("n1", labels, &[]));
        assert_eq!(node.roles, expected);
    }

    #[test]
    fn test_node_display() {
        let node = Node::from(&mock_node(
            "ip-10-0-0-2-abcdef0123",
            &[
                ("node-role.kubernetes.io/control-plane", "true"),
                ("node-role.kubernetes.io/master", "true"),
            ],
            &[(REMOTE_HOST_ANNOTATION, "ssh://root@10.0.0.2:22")],
        ));
        assert!(node.ready);
        assert_eq!(node.remote_host.as_deref(), Some("ssh://root@10.0.0.2:22"));
        assert_eq!(
            node.to_string(),
            "ip-10-0-0-2-abcdef0123|true|control-plane,master|v1.30.2+k3s1"
        );
    }

    #[test]
    fn test_mock_node_keeps_labels_and_annotations() {
        let node = mock_node(
            "n1",
            &[("kubernetes.io/role", "worker")],
            &[(REMOTE_HOST_ANNOTATION, "ssh://ubuntu@10.0.0.9:22")],
        );
        let labels = node.metadata.labels.unwrap();
        assert_eq!(labels["kubernetes.io/role"], "worker");
        let annotations = node.metadata.annotations.unwrap();
        assert_eq!(annotations[REMOTE_HOST_ANNOTATION], "ssh://ubuntu@10.0.0.9:22");
    }

    #[test]
    fn test_node_without_status_is_not_ready() {
        let node = Node::from(&KubeNode::default());
        assert!(!node.ready);
        assert_eq!(node.version, "");
        assert_eq!(node.remote_host, None);
    }

    #[test]
    fn test_node_role() {
        assert_eq!("worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert_eq!(
            "agent".parse::<NodeRole>().unwrap_err().to_string(),
            "Invalid server-type: agent"
        );
        assert_eq!(NodeRole::Server.labels(), SERVER_LABELS);
    }

    #[test]
    fn test_node_name_arg() {
        let args: Vec<String> = ["--token", "t", "--node-name", "ip-1-2-3-4-aa"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(node_name_arg(&args), Some("ip-1-2-3-4-aa"));
        assert_eq!(node_name_arg(&args[..2]), None);
    }
}
