//! Property storage for platform plugins.
//!
//! Properties are small string values scoped by a plugin domain and an app
//! name. The special scope [`GLOBAL_SCOPE`] holds platform-wide defaults.
//!
//! # Layout
//!
//! The file-backed store keeps one file per property:
//!
//! ```text
//! <root>/<domain>/<app>/<key>
//! ```
//!
//! Values are written with write-to-temp + rename so readers never observe a
//! partially written file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Scope name used for platform-wide values.
pub const GLOBAL_SCOPE: &str = "--global";

/// Default root directory of the file-backed store.
pub const DEFAULT_PROPERTIES_ROOT: &str = "/var/lib/plfm/config";

/// File mode for property files.
const PROPERTY_FILE_MODE: u32 = 0o640;

/// Property storage errors.
#[derive(Debug, Error)]
pub enum PropertyError {
    /// A domain, scope or key contains characters that cannot be stored.
    #[error("invalid property {field} '{value}': {reason}")]
    InvalidName {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// IO error.
    #[error("property io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The in-memory store lock was poisoned by a panicking writer.
    #[error("property store lock poisoned")]
    Poisoned,
}

impl PropertyError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Key/value property store scoped by domain and app.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Read a property. Missing properties are `None`.
    async fn get(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<String>, PropertyError>;

    /// Write a property, replacing any previous value.
    async fn set(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PropertyError>;

    /// Delete a property. Deleting a missing property is not an error.
    async fn delete(&self, domain: &str, scope: &str, key: &str) -> Result<(), PropertyError>;

    /// List every property of a scope in key order.
    async fn list(
        &self,
        domain: &str,
        scope: &str,
    ) -> Result<BTreeMap<String, String>, PropertyError>;

    /// Remove every property of a scope.
    async fn destroy(&self, domain: &str, scope: &str) -> Result<(), PropertyError>;

    /// Read a property, returning `default` when it is missing or empty.
    async fn get_or(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
        default: &str,
    ) -> Result<String, PropertyError> {
        Ok(self
            .get(domain, scope, key)
            .await?
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string()))
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), PropertyError> {
    let reason = if value.is_empty() {
        Some("cannot be empty")
    } else if value == "." || value == ".." {
        Some("cannot be a relative path component")
    } else if value.contains('/') || value.contains('\0') {
        Some("cannot contain '/' or NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PropertyError::InvalidName {
            field,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn validate(domain: &str, scope: &str, key: Option<&str>) -> Result<(), PropertyError> {
    validate_name("domain", domain)?;
    validate_name("scope", scope)?;
    if let Some(key) = key {
        validate_name("key", key)?;
    }
    Ok(())
}

// =============================================================================
// File-backed store
// =============================================================================

/// Property store backed by one file per property.
#[derive(Debug, Clone)]
pub struct FilePropertyStore {
    root: PathBuf,
}

impl FilePropertyStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, domain: &str, scope: &str) -> PathBuf {
        self.root.join(domain).join(scope)
    }
}

#[async_trait]
impl PropertyStore for FilePropertyStore {
    async fn get(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<String>, PropertyError> {
        validate(domain, scope, Some(key))?;
        let path = self.scope_dir(domain, scope).join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents.trim_end_matches('\n').to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PropertyError::io(&path, e)),
        }
    }

    async fn set(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PropertyError> {
        validate(domain, scope, Some(key))?;
        let dir = self.scope_dir(domain, scope);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PropertyError::io(&dir, e))?;

        let path = dir.join(key);
        let temp_path = dir.join(format!(".{key}.tmp"));
        {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(PROPERTY_FILE_MODE)
                .open(&temp_path)
                .await
                .map_err(|e| PropertyError::io(&temp_path, e))?;
            file.write_all(value.as_bytes())
                .await
                .map_err(|e| PropertyError::io(&temp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| PropertyError::io(&temp_path, e))?;
        }

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| PropertyError::io(&path, e))?;

        debug!(domain, scope, key, "property written");
        Ok(())
    }

    async fn delete(&self, domain: &str, scope: &str, key: &str) -> Result<(), PropertyError> {
        validate(domain, scope, Some(key))?;
        let path = self.scope_dir(domain, scope).join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PropertyError::io(&path, e)),
        }
    }

    async fn list(
        &self,
        domain: &str,
        scope: &str,
    ) -> Result<BTreeMap<String, String>, PropertyError> {
        validate(domain, scope, None)?;
        let dir = self.scope_dir(domain, scope);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(PropertyError::io(&dir, e)),
        };

        let mut properties = BTreeMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PropertyError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(value) = self.get(domain, scope, &name).await? {
                properties.insert(name, value);
            }
        }

        Ok(properties)
    }

    async fn destroy(&self, domain: &str, scope: &str) -> Result<(), PropertyError> {
        validate(domain, scope, None)?;
        let dir = self.scope_dir(domain, scope);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PropertyError::io(&dir, e)),
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

type PropertyKey = (String, String, String);

/// In-memory property store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<BTreeMap<PropertyKey, String>>,
}

impl MemoryPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper used to seed fixtures.
    pub fn with(self, domain: &str, scope: &str, key: &str, value: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(
                (domain.to_string(), scope.to_string(), key.to_string()),
                value.to_string(),
            );
        }
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<PropertyKey, String>>, PropertyError> {
        self.values.lock().map_err(|_| PropertyError::Poisoned)
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn get(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<String>, PropertyError> {
        validate(domain, scope, Some(key))?;
        let values = self.lock()?;
        Ok(values
            .get(&(domain.to_string(), scope.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        domain: &str,
        scope: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PropertyError> {
        validate(domain, scope, Some(key))?;
        self.lock()?.insert(
            (domain.to_string(), scope.to_string(), key.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    async fn delete(&self, domain: &str, scope: &str, key: &str) -> Result<(), PropertyError> {
        validate(domain, scope, Some(key))?;
        self.lock()?
            .remove(&(domain.to_string(), scope.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(
        &self,
        domain: &str,
        scope: &str,
    ) -> Result<BTreeMap<String, String>, PropertyError> {
        validate(domain, scope, None)?;
        Ok(self
            .lock()?
            .iter()
            .filter(|((d, s, _), _)| d == domain && s == scope)
            .map(|((_, _, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn destroy(&self, domain: &str, scope: &str) -> Result<(), PropertyError> {
        validate(domain, scope, None)?;
        self.lock()?
            .retain(|(d, s, _), _| !(d == domain && s == scope));
        Ok(())
    }
}
