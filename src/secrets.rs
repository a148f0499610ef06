//! Secret lookup and database location.
//!
//! Secrets are key/value maps addressed by a vault-style path. The shipped
//! store reads `<root>/<path>.json`; anything implementing [`SecretStore`] can
//! stand in for a real vault.
use crate::errors::ProcessorError;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub trait SecretStore {
    fn read(&self, path: &str) -> Result<BTreeMap<String, String>>;
}

/// Secrets kept as flat JSON objects on disk.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SecretStore for FileSecretStore {
    fn read(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let rel = path.trim_matches('/');
        if rel.is_empty() || rel.split('/').any(|part| part == "..") {
            return Err(ProcessorError::Config(format!("invalid secret path {path:?}")).into());
        }
        let file = self.root.join(format!("{rel}.json"));
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("read secret {}", file.display()))?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&text)
            .with_context(|| format!("parse secret {}", file.display()))?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect())
    }
}

/// In-memory secrets.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

#[cfg(test)]
impl StaticSecretStore {
    pub fn insert(&mut self, path: &str, key: &str, value: &str) {
        self.entries
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
impl SecretStore for StaticSecretStore {
    fn read(&self, path: &str) -> Result<BTreeMap<String, String>> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| ProcessorError::Config(format!("no secrets at {path:?}")).into())
    }
}

/// Fetch a required key, reporting the vault path on failure.
pub fn required(secrets: &BTreeMap<String, String>, path: &str, key: &str) -> Result<String> {
    secrets
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ProcessorError::Config(format!("secret {path} is missing required key {key}")).into()
        })
}

fn secret_flag(secrets: &BTreeMap<String, String>, key: &str) -> bool {
    secrets
        .get(key)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

/// Where the ledger database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLocation {
    /// Resolved host directory (after `production`/`dev` alias expansion).
    pub host: String,
    /// Database name including the dev suffix when requested.
    pub name: String,
}

impl DatabaseLocation {
    pub fn path(&self) -> PathBuf {
        Path::new(&self.host).join(format!("{}.sqlite3", self.name))
    }
}

/// Resolve `DB_host` (an alias or a literal) and `DB_name` (+ optional dev suffix).
pub fn resolve_database(secrets: &dyn SecretStore, vault_path: &str) -> Result<DatabaseLocation> {
    let values = secrets.read(vault_path)?;
    let host_ref = required(&values, vault_path, "DB_host")?;
    let host = match host_ref.to_ascii_lowercase().as_str() {
        "production" => required(&values, vault_path, "DB_host_production")?,
        "dev" => required(&values, vault_path, "DB_host_dev")?,
        _ => host_ref,
    };
    let mut name = required(&values, vault_path, "DB_name")?;
    if secret_flag(&values, "DB_use_dev_suffix") {
        let suffix = values
            .get("DB_dev_suffix")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "_dev".to_string());
        name.push_str(&suffix);
    }
    Ok(DatabaseLocation { host, name })
}
