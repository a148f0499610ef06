//! Shared test infrastructure for integration tests.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A throwaway site: secrets, ledger directory, configs and input lists.
pub struct Site {
    pub dir: TempDir,
}

/// Result from running the `processor` binary.
#[derive(Debug)]
pub struct RunResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    fn from_output(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Stdout lines starting with `prefix`, in order.
    pub fn stream(&self, prefix: &str) -> Vec<&str> {
        self.stdout
            .lines()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }
}

impl Site {
    /// Secrets for a dev-host ledger and an on-prem module under a temp root.
    pub fn new() -> anyhow::Result<Self> {
        let site = Self {
            dir: TempDir::new()?,
        };
        let root = site.root().display().to_string();
        site.write_secret(
            "db",
            json!({
                "DB_host": "dev",
                "DB_host_dev": root,
                "DB_name": "ledger"
            }),
        )?;
        site.write_secret(
            "onprem",
            json!({
                "orthanc_url": "http://127.0.0.1:9",
                "orthanc_token": "test-token",
                "stage_db_name": "stage_onprem",
                "target_root": root
            }),
        )?;
        Ok(site)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root().join("secrets")
    }

    fn write_secret(&self, path: &str, values: Value) -> anyhow::Result<()> {
        let dir = self.secrets_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{path}.json")), serde_json::to_string_pretty(&values)?)?;
        Ok(())
    }

    /// Write `<root>/<name>.json`, pointing the vault paths at this site's secrets.
    pub fn config(&self, name: &str, mut values: Value) -> anyhow::Result<PathBuf> {
        if let Some(map) = values.as_object_mut() {
            map.entry("db_vault_path").or_insert_with(|| json!("db"));
            map.entry("onprem_vault_path").or_insert_with(|| json!("onprem"));
        }
        let path = self.root().join(format!("{name}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&values)?)?;
        Ok(path)
    }

    /// Write an input list, one entry per line.
    pub fn manifest(&self, name: &str, lines: &[&str]) -> anyhow::Result<PathBuf> {
        let path = self.root().join(name);
        std::fs::write(&path, format!("{}\n", lines.join("\n")))?;
        Ok(path)
    }

    /// Run `processor <subcommand> --config <config> --secrets-dir <secrets>`.
    pub fn processor(
        &self,
        subcommand: &[&str],
        config: &Path,
        env: &[(&str, &str)],
    ) -> anyhow::Result<RunResult> {
        let output = Command::new(env!("CARGO_BIN_EXE_processor"))
            .args(subcommand)
            .arg("--config")
            .arg(config)
            .arg("--secrets-dir")
            .arg(self.secrets_dir())
            .envs(env.iter().copied())
            .env_remove("RUST_LOG")
            .output()?;
        Ok(RunResult::from_output(output))
    }
}
