//! System-status gate: a shared kill switch in `aaa_locutus_status`.
//!
//! Rows are append-only; the newest row for a `(status_type, status_node)`
//! pair decides. A scope with no rows at all is open.
use crate::ledger::{Database, WriteMode};
use crate::streams::Streams;
use crate::util::{now_timestamp, sql_literal};
use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::fmt;
use std::rc::Rc;

pub const GATE_TABLE: &str = "aaa_locutus_status";
pub const OVERALL_NODE: &str = "system-wide";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateScope {
    Overall,
    /// Keyed by host name.
    PerNode(String),
    /// Keyed by module name.
    PerModule(String),
}

impl GateScope {
    /// Build a scope from the configured `system_status_type` / `_node` pair.
    pub fn parse(status_type: &str, node: &str) -> Result<Self> {
        match status_type.trim().to_ascii_lowercase().as_str() {
            "overall" => Ok(GateScope::Overall),
            "per-node" if !node.trim().is_empty() => Ok(GateScope::PerNode(node.trim().to_string())),
            "per-module" if !node.trim().is_empty() => {
                Ok(GateScope::PerModule(node.trim().to_string()))
            }
            other => Err(crate::errors::ProcessorError::Config(format!(
                "system status scope {other:?} needs one of overall, per-node, per-module (with a node)"
            ))
            .into()),
        }
    }

    pub fn status_type(&self) -> &'static str {
        match self {
            GateScope::Overall => "overall",
            GateScope::PerNode(_) => "per-node",
            GateScope::PerModule(_) => "per-module",
        }
    }

    pub fn node(&self) -> &str {
        match self {
            GateScope::Overall => OVERALL_NODE,
            GateScope::PerNode(node) | GateScope::PerModule(node) => node,
        }
    }
}

impl fmt::Display for GateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.status_type(), self.node())
    }
}

/// Anything that can say whether work may continue.
pub trait GateCheck {
    /// The first closed scope, or `None` when every scope is open.
    fn closed_scope(&self) -> Result<Option<GateScope>>;
}

pub struct Gate {
    db: Rc<Database>,
}

impl Gate {
    pub fn open(db: Rc<Database>) -> Result<Self> {
        db.conn()
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {GATE_TABLE} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status_type TEXT NOT NULL,
                    status_node TEXT NOT NULL,
                    status_desc TEXT NOT NULL DEFAULT '',
                    date_updated TEXT NOT NULL,
                    active INTEGER NOT NULL
                );"
            ))
            .context("install gate table")?;
        Ok(Self { db })
    }

    pub fn is_active(&self, scope: &GateScope) -> Result<bool> {
        let active: Option<bool> = self
            .db
            .conn()
            .query_row(
                &format!(
                    "SELECT active FROM {GATE_TABLE} WHERE status_type = ?1 AND status_node = ?2
                     ORDER BY date_updated DESC, id DESC LIMIT 1"
                ),
                [scope.status_type(), scope.node()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read gate {scope}"))?;
        Ok(active.unwrap_or(true))
    }

    /// Append a row for `scope`; under dry-run the insert is only printed.
    pub fn write(
        &self,
        scope: &GateScope,
        active: bool,
        desc: &str,
        mode: WriteMode,
        streams: &Streams,
    ) -> Result<()> {
        let now = now_timestamp();
        streams.sql(&format!(
            "INSERT INTO {GATE_TABLE} (status_type, status_node, status_desc, date_updated, active) VALUES ({}, {}, {}, {}, {});",
            sql_literal(scope.status_type()),
            sql_literal(scope.node()),
            sql_literal(desc),
            sql_literal(&now),
            i64::from(active)
        ));
        if mode.is_dry_run() {
            return Ok(());
        }
        self.db
            .conn()
            .execute(
                &format!(
                    "INSERT INTO {GATE_TABLE} (status_type, status_node, status_desc, date_updated, active)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![scope.status_type(), scope.node(), desc, now, active],
            )
            .with_context(|| format!("write gate {scope}"))?;
        tracing::info!(scope = %scope, active, "gate updated");
        Ok(())
    }
}

/// A gate bound to the scopes one engine process answers to.
pub struct GateProbe {
    gate: Rc<Gate>,
    scopes: Vec<GateScope>,
}

impl GateProbe {
    pub fn new(gate: Rc<Gate>, scopes: Vec<GateScope>) -> Self {
        Self { gate, scopes }
    }

    /// Every scope with its current flag, in probe order.
    pub fn report(&self) -> Result<Vec<(GateScope, bool)>> {
        self.scopes
            .iter()
            .map(|scope| Ok((scope.clone(), self.gate.is_active(scope)?)))
            .collect()
    }
}

impl GateCheck for GateProbe {
    fn closed_scope(&self) -> Result<Option<GateScope>> {
        for scope in &self.scopes {
            if !self.gate.is_active(scope)? {
                return Ok(Some(scope.clone()));
            }
        }
        Ok(None)
    }
}
