//! App environment file format.
//!
//! Each app keeps its configuration in a shell-sourceable `ENV` file so the
//! same file can be consumed by plugins written in any language.
//!
//! # Format
//!
//! ```text
//! export DATABASE_URL='postgres://db/app'
//! export GREETING='it'\''s here'
//! ```
//!
//! Keys must match `[A-Za-z_][A-Za-z0-9_]*`. Values are single-quoted; an
//! embedded quote is written as `'\''`. The parser also accepts bare
//! `KEY=value` lines and double-quoted values for hand-edited files.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use thiserror::Error;

/// File name of the env file inside an app directory.
pub const ENV_FILE_NAME: &str = "ENV";

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum value length in bytes.
pub const MAX_VALUE_LENGTH: usize = 64 * 1024;

/// Env file errors.
#[derive(Debug, Error)]
pub enum EnvFileError {
    /// Invalid key format.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Invalid value format.
    #[error("invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Parse error.
    #[error("parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// An app environment (sorted key-value pairs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    inner: BTreeMap<String, String>,
}

impl EnvFile {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the previous one.
    pub fn set<K: Into<String>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<String>, EnvFileError> {
        let key = key.into();
        let value = value.into();

        validate_key(&key)?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(EnvFileError::InvalidValue {
                key,
                reason: format!("value exceeds maximum length of {} bytes", MAX_VALUE_LENGTH),
            });
        }

        Ok(self.inner.insert(key, value))
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(|s| s.as_str())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `other` on top of `self`. Keys in `other` win.
    pub fn merged(&self, other: &EnvFile) -> EnvFile {
        let mut inner = self.inner.clone();
        inner.extend(other.inner.iter().map(|(k, v)| (k.clone(), v.clone())));
        EnvFile { inner }
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.inner
    }

    /// Serialize to canonical `export KEY='value'` lines.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.inner {
            out.push_str("export ");
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_value(value));
            out.push('\n');
        }
        out
    }

    /// Parse env file content.
    pub fn parse(content: &str) -> Result<Self, EnvFileError> {
        let mut env = Self::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            parse_line(idx + 1, line, &mut env)?;
        }
        Ok(env)
    }

    /// Read from a file. A missing file is an empty environment.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, EnvFileError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a file atomically, readable by owner and group only.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), EnvFileError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o640)
                .open(&temp_path)?;

            file.write_all(self.serialize().as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), EnvFileError> {
    let invalid = |reason: String| EnvFileError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("key cannot be empty".to_string()));
    };

    if key.len() > MAX_KEY_LENGTH {
        return Err(invalid(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(
            "key must start with a letter or underscore".to_string(),
        ));
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(invalid(format!("invalid character '{}' in key", c)));
        }
    }

    Ok(())
}

/// Single-quote a value for the shell.
fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Decode a raw value: concatenated single-quoted, double-quoted and bare segments.
fn unquote_value(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => out.push(c),
                    None => return Err("unterminated single quote".to_string()),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some(c) => out.push(c),
                        None => return Err("dangling escape".to_string()),
                    },
                    Some(c) => out.push(c),
                    None => return Err("unterminated double quote".to_string()),
                }
            },
            '\\' => match chars.next() {
                Some(c) => out.push(c),
                None => return Err("dangling escape".to_string()),
            },
            c => out.push(c),
        }
    }

    Ok(out)
}

fn parse_line(line_num: usize, line: &str, env: &mut EnvFile) -> Result<(), EnvFileError> {
    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    let Some((key, value)) = line.split_once('=') else {
        return Err(EnvFileError::ParseError {
            line: line_num,
            reason: "expected KEY=value format".to_string(),
        });
    };

    let value = unquote_value(value.trim()).map_err(|reason| EnvFileError::ParseError {
        line: line_num,
        reason,
    })?;

    env.set(key.trim(), value)
        .map_err(|e| EnvFileError::ParseError {
            line: line_num,
            reason: e.to_string(),
        })?;

    Ok(())
}
