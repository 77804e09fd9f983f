//! k3s installer download and invocation arguments.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;

use reqwest::StatusCode;
use tempfile::TempPath;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Where remote nodes keep the installer.
pub const REMOTE_INSTALLER_PATH: &str = "/tmp/k3s-installer.sh";

/// Port of the k3s API server that joining nodes register with.
pub const SUPERVISOR_PORT: u16 = 6443;

/// Packages k3s needs on every node.
pub const APT_PACKAGES: &[&str] = &[
    "ca-certificates",
    "curl",
    "open-iscsi",
    "nfs-common",
    "wireguard",
];

/// Taint keeping workloads off a server node.
pub const CRITICAL_ADDONS_TAINT: &str = "CriticalAddonsOnly=true:NoSchedule";

/// Lowercase hex of five random bytes.
pub fn random_hex() -> String {
    hex::encode(rand::random::<[u8; 5]>())
}

/// Cluster join token.
pub fn generate_token() -> String {
    random_hex()
}

/// `ip-<address>-<hex>` with dots turned into dashes.
pub fn node_name(address: &str) -> String {
    format!("ip-{address}-{}", random_hex())
        .to_lowercase()
        .replace('.', "-")
}

/// Download the installer script into a private executable temp file.
///
/// The file is removed when the returned path is dropped.
pub async fn download_installer(client: &reqwest::Client, url: &str) -> Result<TempPath> {
    let response = client.get(url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(SchedulerError::config(format!(
            "Invalid status code for k3s installer script: {}",
            response.status().as_u16()
        )));
    }
    let body = response.bytes().await?;

    let path = tempfile::Builder::new()
        .prefix("k3s-installer-")
        .suffix(".sh")
        .tempfile()
        .map_err(|e| SchedulerError::io("Unable to create temporary file for k3s installer", e))?
        .into_temp_path();

    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| SchedulerError::path_io(&path, e))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| SchedulerError::path_io(&path, e))?;

    let size = tokio::fs::metadata(&path)
        .await
        .map_err(|e| SchedulerError::path_io(&path, e))?
        .len();
    if size == 0 {
        return Err(SchedulerError::config("Invalid k3s installer filesize"));
    }

    debug!(url = %url, path = %path.display(), size, "Downloaded k3s installer");
    Ok(path)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Arguments that open metrics and controller ports on server nodes.
fn server_bind_args() -> Vec<String> {
    strings(&[
        "--kube-controller-manager-arg",
        "bind-address=0.0.0.0",
        "--kube-proxy-arg",
        "metrics-bind-address=0.0.0.0",
        "--kube-scheduler-arg",
        "bind-address=0.0.0.0",
        "--kube-controller-manager-arg",
        "terminated-pod-gc-threshold=10",
    ])
}

/// Arguments for the first server of a new cluster.
pub fn init_args(node_name: &str, token: &str, taint_scheduling: bool) -> Vec<String> {
    let mut args = strings(&[
        "--cluster-init",
        "--disable",
        "local-storage",
        "--disable",
        "traefik",
        "--etcd-expose-metrics",
        "--flannel-backend=wireguard-native",
    ]);
    args.extend(server_bind_args());
    args.extend(strings(&[
        "--node-name",
        node_name,
        "--write-kubeconfig-mode",
        "0644",
        "--token",
        token,
    ]));
    if taint_scheduling {
        args.extend(strings(&["--node-taint", CRITICAL_ADDONS_TAINT]));
    }
    args
}

/// Arguments for a node joining `server_ip`.
pub fn join_args(
    is_server: bool,
    node_name: &str,
    server_ip: &str,
    token: &str,
    taint_scheduling: bool,
) -> Vec<String> {
    let server_url = format!("https://{server_ip}:{SUPERVISOR_PORT}");
    let mut args = strings(&[
        "--disable",
        "local-storage",
        "--flannel-backend=wireguard-native",
        "--node-name",
        node_name,
        "--server",
        &server_url,
        "--token",
        token,
    ]);
    if is_server {
        args.insert(0, "server".to_string());
        args.push("--etcd-expose-metrics".to_string());
        args.extend(server_bind_args());
        args.extend(strings(&["--write-kubeconfig-mode", "0644"]));
    } else {
        args.extend(strings(&[
            "--disable-etcd",
            "--disable-apiserver",
            "--disable-controller-manager",
            "--disable-scheduler",
            "--kube-proxy-arg",
            "metrics-bind-address=0.0.0.0",
        ]));
    }
    if taint_scheduling {
        args.extend(strings(&["--node-taint", CRITICAL_ADDONS_TAINT]));
    }
    args
}

/// Last IPv4 address bound to `interface`.
pub fn interface_ipv4(interface: &str) -> Result<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| {
        SchedulerError::config(format!("Unable to get network interfaces: {e}"))
    })?;
    addrs
        .filter(|a| a.interface_name == interface)
        .filter_map(|a| a.address.and_then(|s| s.as_sockaddr_in().map(|sin| sin.ip())))
        .last()
        .ok_or_else(|| {
            SchedulerError::config(format!(
                "Unable to determine server ip address from network-interface {interface}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_node_name() {
        let name = node_name("10.0.0.2");
        assert!(name.starts_with("ip-10-0-0-2-"), "{name}");
        assert_eq!(name.len(), "ip-10-0-0-2-".len() + 10);
        assert!(!name.contains('.'));
    }

    #[test]
    fn test_generate_token() {
        let token = generate_token();
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_init_args() {
        let args = init_args("ip-10-0-0-2-aa", "tok", true);
        assert_eq!(&args[..7], &[
            "--cluster-init",
            "--disable",
            "local-storage",
            "--disable",
            "traefik",
            "--etcd-expose-metrics",
            "--flannel-backend=wireguard-native",
        ]);
        let joined = args.join(" ");
        assert!(joined.contains("--node-name ip-10-0-0-2-aa"));
        assert!(joined.contains("--write-kubeconfig-mode 0644"));
        assert!(joined.contains("--token tok"));
        assert!(joined.ends_with("--node-taint CriticalAddonsOnly=true:NoSchedule"));
    }

    #[test]
    fn test_join_args() {
        let server = join_args(true, "n1", "10.0.0.1", "tok", false);
        assert_eq!(server[0], "server");
        assert!(server.join(" ").contains("--server https://10.0.0.1:6443 --token tok"));
        assert!(server.contains(&"--etcd-expose-metrics".to_string()));

        let worker = join_args(false, "n2", "10.0.0.1", "tok", false);
        assert_eq!(worker[0], "--disable");
        for flag in [
            "--disable-etcd",
            "--disable-apiserver",
            "--disable-controller-manager",
            "--disable-scheduler",
        ] {
            assert!(worker.contains(&flag.to_string()), "{flag}");
        }
        assert!(!worker.contains(&"--node-taint".to_string()));
    }

    #[tokio::test]
    async fn test_download_installer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\necho k3s\n"))
            .mount(&server)
            .await;

        let installer = download_installer(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap();
        let metadata = std::fs::metadata(&installer).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
        assert_eq!(
            std::fs::read_to_string(&installer).unwrap(),
            "#!/bin/sh\necho k3s\n"
        );

        let kept = installer.to_path_buf();
        drop(installer);
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn test_download_installer_rejects_bad_status_and_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = download_installer(&client, &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid status code for k3s installer script: 404");

        let err = download_installer(&client, &format!("{}/empty", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid k3s installer filesize");
    }

    #[test]
    fn test_interface_ipv4_unknown_interface() {
        let err = interface_ipv4("plfm-does-not-exist0").unwrap_err();
        assert!(err.to_string().contains("network-interface plfm-does-not-exist0"));
    }
}
