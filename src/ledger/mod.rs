//! Ledger storage: the per-workspace `manifest` and `status` tables plus the
//! upstream-owned stage table, all reached through one SQLite connection.
//!
//! Every mutation is autocommit. Stage tables live in a per-module database
//! attached under the `stage_<module>` alias.
mod rows;
mod store;

pub use rows::{ManifestRow, ModuleAttrs, StageRow, StatusRow};
pub use store::Ledger;

use crate::config::ModuleKind;
use crate::util::sql_literal;
use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Whether a ledger mutation executes or is only printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Apply,
    DryRun,
}

impl WriteMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            WriteMode::DryRun
        } else {
            WriteMode::Apply
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, WriteMode::DryRun)
    }
}

/// The shared SQLite handle.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open ledger {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::debug!(path = %path.display(), "ledger opened");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Attach a module's stage database. `:memory:` is accepted.
    pub fn attach_stage(&self, kind: ModuleKind, target: &str) -> Result<()> {
        let alias = stage_alias(kind);
        let attached: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_database_list WHERE name = ?1",
                [&alias],
                |row| row.get(0),
            )
            .context("list attached databases")?;
        if attached {
            return Ok(());
        }
        self.conn
            .execute(&format!("ATTACH DATABASE ?1 AS {alias}"), [target])
            .with_context(|| format!("attach stage database {target} as {alias}"))?;
        tracing::debug!(alias, target, "stage database attached");
        Ok(())
    }
}

fn stage_alias(kind: ModuleKind) -> String {
    format!("stage_{}", kind.as_str())
}

/// Table names for one module, computed once at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub manifest: String,
    pub status: String,
    /// Schema-qualified (`stage_<module>.<module>_stage_studies`).
    pub stage_studies: String,
}

impl TableNames {
    /// Workspace tables are `{module}_ws_{workspace}_{table}`; stage tables are
    /// owned upstream and never workspaced.
    pub fn for_module(kind: ModuleKind, workspace: Option<&str>) -> Self {
        let prefix = match workspace {
            Some(name) => format!("{}_ws_{name}", kind.as_str()),
            None => kind.as_str().to_string(),
        };
        Self {
            manifest: format!("{prefix}_manifest"),
            status: format!("{prefix}_status"),
            stage_studies: format!("{}.{}_stage_studies", stage_alias(kind), kind.as_str()),
        }
    }

    pub(crate) fn install(&self, conn: &Connection) -> Result<()> {
        let manifest = &self.manifest;
        let status = &self.status;
        let stage = &self.stage_studies;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {manifest} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                accession_num TEXT NOT NULL,
                manifest_status TEXT NOT NULL,
                last_datetime_processed TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                subject_id TEXT NOT NULL DEFAULT '',
                object_info TEXT NOT NULL DEFAULT '[]'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {manifest}_one_active
                ON {manifest}(accession_num) WHERE active = 1;
            CREATE TABLE IF NOT EXISTS {status} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                accession_num TEXT NOT NULL,
                uuid TEXT NOT NULL,
                change_seq_id INTEGER NOT NULL,
                phase_processed INTEGER NOT NULL,
                datetime_processed TEXT NOT NULL,
                deidentified_targets TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                subject_id TEXT NOT NULL DEFAULT '',
                object_info TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS {status}_accession ON {status}(accession_num, active);
            CREATE TABLE IF NOT EXISTS {stage} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                accession_str TEXT NOT NULL,
                uuid TEXT NOT NULL,
                change_seq_id INTEGER NOT NULL,
                datetime_staged TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );"
        ))
        .with_context(|| format!("install ledger tables {manifest}, {status}, {stage}"))?;
        Ok(())
    }
}

/// A parameterised statement that can also be printed with its values inlined.
#[derive(Debug, Clone)]
pub(crate) struct Sql {
    text: String,
    params: Vec<Value>,
}

impl Sql {
    pub(crate) fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub(crate) fn text(mut self, value: &str) -> Self {
        self.params.push(Value::Text(value.to_string()));
        self
    }

    pub(crate) fn int(mut self, value: i64) -> Self {
        self.params.push(Value::Integer(value));
        self
    }

    pub(crate) fn sql(&self) -> &str {
        &self.text
    }

    pub(crate) fn params(&self) -> rusqlite::ParamsFromIter<std::slice::Iter<'_, Value>> {
        rusqlite::params_from_iter(self.params.iter())
    }

    /// The statement on one line with `?N` placeholders replaced by literals.
    ///
    /// Only the template's whitespace is collapsed; inlined values keep theirs.
    pub(crate) fn rendered(&self) -> String {
        let template = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let Ok(placeholder) = Regex::new(r"\?(\d+)") else {
            return template;
        };
        placeholder
            .replace_all(&template, |caps: &regex::Captures<'_>| {
                let value = caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| index.checked_sub(1))
                    .and_then(|index| self.params.get(index));
                match value {
                    Some(Value::Null) => "NULL".to_string(),
                    Some(Value::Integer(number)) => number.to_string(),
                    Some(Value::Real(number)) => number.to_string(),
                    Some(Value::Text(text)) => sql_literal(text),
                    Some(Value::Blob(bytes)) => format!("<{} bytes>", bytes.len()),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
