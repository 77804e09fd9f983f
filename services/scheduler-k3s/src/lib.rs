//! plfm k3s Scheduler Library
//!
//! Runs plfm apps on a k3s cluster. Each process type of an app becomes a
//! helm release holding a generated chart; imported certificates ship as
//! their own release; cluster membership is managed over ssh.
//!
//! ## Architecture
//!
//! ```text
//! deploy event
//!   └── Deployer
//!       ├── ResourceResolver   (limits/requests from properties)
//!       ├── manifest           (objects rendered into a chart directory)
//!       ├── ChartManager       (helm install/upgrade/uninstall)
//!       └── ReadinessWaiter    (pod phase polling)
//!
//! TlsSynchronizer     tls-<app> release, independent of deploys
//! ClusterManager      initialize, add/remove nodes, uninstall
//! ```
//!
//! Every call to the Kubernetes API goes through the `ClusterClient` trait,
//! and every wait goes through the `Clock` trait, so the whole flow runs
//! against in-memory fakes in tests.
//!
//! ## Modules
//!
//! - `cluster_client`: Kubernetes API facade
//! - `manifest`: object builders and the chart writer
//! - `helm`: release deployer
//! - `readiness`: pod readiness and exec
//! - `tls`: certificate synchronizer
//! - `cluster`: k3s installation and node membership
//! - `deploy`: deploy orchestration
//! - `run`: one-off jobs and shells
//! - `cron`: cron entry aggregation
//! - `properties`: scheduler settings in the property store

pub mod appjson;
pub mod cancel;
pub mod clock;
pub mod cluster;
pub mod cluster_client;
pub mod config;
pub mod cron;
pub mod deploy;
pub mod error;
pub mod helm;
pub mod manifest;
pub mod portmap;
pub mod properties;
pub mod providers;
pub mod quantity;
pub mod readiness;
pub mod resources;
pub mod run;
pub mod shell;
pub mod tls;

// Re-export commonly used types
pub use cancel::{cancel_on_shutdown, CancelToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterAddInput, ClusterManager, InitializeInput};
pub use cluster_client::{ClusterClient, KubeClusterClient, LazyClusterClient, MockClusterClient};
pub use config::SchedulerConfig;
pub use deploy::{DeployOutcome, DeployRequest, Deployer};
pub use error::{Result, SchedulerError};
pub use helm::{ChartManager, HelmCli, MockChartManager};
pub use properties::Properties;
pub use providers::Providers;
pub use readiness::ReadinessWaiter;
pub use run::{EnterRequest, RunOutcome, RunRequest, Runner};
pub use tls::TlsSynchronizer;
