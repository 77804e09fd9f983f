//! Chart directory writer.
//!
//! ```text
//! <tmp>/Chart.yaml
//! <tmp>/values.yaml
//! <tmp>/files/<kind>-<name>.yaml       one rendered object each
//! <tmp>/templates/manifests.yaml       inlines files/*.yaml
//! ```
//!
//! Objects are stored as plain files and pulled in with `.Files.Get`, so helm
//! never evaluates their contents as templates.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::debug;

use super::Manifest;
use crate::error::{Result, SchedulerError};

pub const CHART_API_VERSION: &str = "v2";
pub const CHART_APP_VERSION: &str = "1.0.0";

/// Template that emits every file under `files/` as its own document.
pub const MANIFESTS_TEMPLATE: &str = r#"{{- range $path, $_ := .Files.Glob "files/*.yaml" }}
---
{{ $.Files.Get $path }}
{{- end }}
"#;

/// `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub api_version: String,
    pub app_version: String,
    pub name: String,
    pub version: String,
}

impl ChartMetadata {
    /// Chart `name` at version `0.0.<revision>`.
    pub fn new(name: &str, revision: i64) -> Self {
        Self {
            api_version: CHART_API_VERSION.to_string(),
            app_version: CHART_APP_VERSION.to_string(),
            name: name.to_string(),
            version: format!("0.0.{revision}"),
        }
    }
}

/// Render every chart file, keyed by relative path.
pub fn render(
    metadata: &ChartMetadata,
    values: &serde_json::Value,
    manifests: &[Manifest],
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    files.insert("Chart.yaml".to_string(), serde_yaml::to_string(metadata)?);
    files.insert("values.yaml".to_string(), serde_yaml::to_string(values)?);
    files.insert(
        "templates/manifests.yaml".to_string(),
        MANIFESTS_TEMPLATE.to_string(),
    );
    for manifest in manifests {
        files.insert(format!("files/{}", manifest.file_name()), manifest.yaml.clone());
    }
    Ok(files)
}

/// A chart written to a temporary directory, removed on drop.
#[derive(Debug)]
pub struct ChartDir {
    dir: TempDir,
    pub metadata: ChartMetadata,
}

impl ChartDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Write a chart for `metadata.name` into a fresh temporary directory.
pub async fn write_chart(
    metadata: ChartMetadata,
    values: &serde_json::Value,
    manifests: &[Manifest],
) -> Result<ChartDir> {
    let files = render(&metadata, values, manifests)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-chart-", metadata.name))
        .tempdir()
        .map_err(|e| SchedulerError::io("Error creating chart directory", e))?;

    for (relative, content) in &files {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SchedulerError::path_io(parent, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SchedulerError::path_io(&path, e))?;
    }

    debug!(chart = %metadata.name, path = %dir.path().display(), files = files.len(), "Wrote chart");
    Ok(ChartDir { dir, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifests() -> Vec<Manifest> {
        vec![
            Manifest::new("Service", "foo-web", &json!({"kind": "Service"})).unwrap(),
            Manifest::new("Deployment", "foo-web", &json!({"kind": "Deployment"})).unwrap(),
        ]
    }

    #[test]
    fn test_chart_metadata() {
        let yaml = serde_yaml::to_string(&ChartMetadata::new("foo-web", 1700000000)).unwrap();
        assert!(yaml.contains("apiVersion: v2"));
        assert!(yaml.contains("appVersion: 1.0.0"));
        assert!(yaml.contains("version: 0.0.1700000000"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let metadata = ChartMetadata::new("foo-web", 1);
        let values = json!({"b": 1, "a": 2});
        let first = render(&metadata, &values, &manifests()).unwrap();
        let mut reversed = manifests();
        reversed.reverse();
        let second = render(&metadata, &values, &reversed).unwrap();
        assert_eq!(first, second);
        assert!(first.contains_key("files/deployment-foo-web.yaml"));
    }

    #[tokio::test]
    async fn test_write_chart() {
        let chart = write_chart(ChartMetadata::new("foo-web", 1), &json!({}), &manifests())
            .await
            .unwrap();
        let path = chart.path().to_path_buf();
        assert!(path.join("Chart.yaml").exists());
        assert!(path.join("templates/manifests.yaml").exists());
        assert_eq!(
            std::fs::read_to_string(path.join("files/service-foo-web.yaml")).unwrap(),
            "kind: Service\n"
        );

        drop(chart);
        assert!(!path.exists());
    }
}
