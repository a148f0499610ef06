//! Multi-uuid resolution: repair accessions staged under more than one uuid.
//!
//! Each input row names a sub-command in its `RESOLVE_VIA` column. A command
//! either reaches its terminal status (written to the manifest row, keeping
//! any on-deck wrapper and suffix) or leaves the ledger untouched and reports
//! `ERROR_RESOLVING_MULTIUUID_CANDIDATE:<command>`.
use crate::errors::{classify_failure, truncated_chain, ProcessorError};
use crate::ledger::{Ledger, ModuleAttrs, StatusRow, WriteMode};
use crate::status::{Status, StatusKind, MIN_PHASE};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveVia {
    MergeAtRadiology,
    ResendRadiology,
    ConsolidateLocally,
    ChooseLocally { uuid: String },
    DeleteScanLocally,
    DeleteScanFromStageOnly,
}

impl ResolveVia {
    /// Parse a `RESOLVE_VIA` cell. Command names are case-sensitive.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw {
            "MERGE_at_RADIOLOGY" => return Ok(ResolveVia::MergeAtRadiology),
            "RESEND_RADIOLOGY" => return Ok(ResolveVia::ResendRadiology),
            "CONSOLIDATE_LOCALLY" => return Ok(ResolveVia::ConsolidateLocally),
            "DELETE_SCAN_LOCALLY" => return Ok(ResolveVia::DeleteScanLocally),
            "DELETE_SCAN_FROM_STAGE_ONLY" => return Ok(ResolveVia::DeleteScanFromStageOnly),
            _ => {}
        }
        let choose = Regex::new(r"^CHOOSE_LOCALLY:uuid=([A-Za-z0-9-]+)$")
            .context("compile choose pattern")?;
        if let Some(caps) = choose.captures(raw) {
            return Ok(ResolveVia::ChooseLocally {
                uuid: caps[1].to_string(),
            });
        }
        Err(ProcessorError::Resolver {
            accession: String::new(),
            command: raw.to_string(),
            reason: "unknown resolve_via command".to_string(),
        }
        .into())
    }

    /// Counter label.
    pub fn label(&self) -> &'static str {
        match self {
            ResolveVia::MergeAtRadiology => "RADIOLOGY_MERGE",
            ResolveVia::ResendRadiology => "RADIOLOGY_RESEND",
            ResolveVia::ConsolidateLocally => "CONSOLIDATE",
            ResolveVia::ChooseLocally { .. } => "CHOOSE",
            ResolveVia::DeleteScanLocally => "DELETE_LOCALLY",
            ResolveVia::DeleteScanFromStageOnly => "DELETE_STAGE_ONLY",
        }
    }

    fn terminal(&self) -> StatusKind {
        match self {
            ResolveVia::MergeAtRadiology => StatusKind::PendingChangeRadiologyMerge,
            ResolveVia::ResendRadiology => StatusKind::PendingChangeRadiologyResend,
            ResolveVia::ConsolidateLocally => StatusKind::ResolvedMultiuuidsConsolidatedLocally,
            ResolveVia::ChooseLocally { .. } => StatusKind::ResolvedMultiuuidsChosenLocally,
            ResolveVia::DeleteScanLocally => StatusKind::ResolvedMultiuuidsDeletedLocally,
            ResolveVia::DeleteScanFromStageOnly => StatusKind::ResolvedMultiuuidsDeletedOnStageOnly,
        }
    }
}

const UNKNOWN_LABEL: &str = "UNKNOWN";
const MAX_REASON_BYTES: usize = 160;

/// What a resolver call did, with the status to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(Status),
    /// Already resolved earlier in this run.
    RecentlyResolved(Status),
    /// Already waiting on a radiology merge/resend.
    FormerlyResolved(Status),
    Failed(Status),
}

impl ResolveOutcome {
    pub fn status(&self) -> &Status {
        match self {
            ResolveOutcome::Resolved(status)
            | ResolveOutcome::RecentlyResolved(status)
            | ResolveOutcome::FormerlyResolved(status)
            | ResolveOutcome::Failed(status) => status,
        }
    }
}

/// Per-run resolver state.
pub struct Resolver {
    mode: WriteMode,
    recently_resolved: HashSet<String>,
    counters: BTreeMap<String, u64>,
}

impl Resolver {
    pub fn new(mode: WriteMode) -> Self {
        Self {
            mode,
            recently_resolved: HashSet::new(),
            counters: BTreeMap::new(),
        }
    }

    /// `total_resolved_successfully_via<LABEL>` / `errors_resolving_via<LABEL>`.
    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    pub fn error_count(&self) -> u64 {
        self.counters
            .iter()
            .filter(|(name, _)| name.starts_with("errors_resolving_via"))
            .map(|(_, count)| count)
            .sum()
    }

    fn bump(&mut self, name: String) {
        *self.counters.entry(name).or_insert(0) += 1;
    }

    /// Apply the `resolve_via` command for one accession.
    ///
    /// Only fatal failures (credentials, ledger, gate) are returned as `Err`.
    /// Anything else, including a command that does not fit the ledger's
    /// shape, is a [`ResolveOutcome::Failed`].
    pub fn resolve(
        &mut self,
        ledger: &Ledger,
        accession: &str,
        attrs: &ModuleAttrs,
        resolve_via: &str,
    ) -> Result<ResolveOutcome> {
        let current = ledger
            .active_manifest(accession)?
            .map(|row| row.status())
            .unwrap_or_else(Status::not_found);

        if self.recently_resolved.contains(accession) {
            tracing::info!(accession, "recently_resolved; skipping");
            return Ok(ResolveOutcome::RecentlyResolved(current));
        }
        if current.kind.is_pending_radiology() {
            tracing::info!(accession, status = %current, "formerly_resolved; skipping");
            return Ok(ResolveOutcome::FormerlyResolved(current));
        }

        let command = match ResolveVia::parse(resolve_via) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(accession, resolve_via, error = %err, "cannot resolve");
                self.bump(format!("errors_resolving_via{UNKNOWN_LABEL}"));
                return Ok(ResolveOutcome::Failed(failure_status(resolve_via)));
            }
        };

        match self.apply(ledger, accession, attrs, &command, &current) {
            Ok(terminal) => {
                self.recently_resolved.insert(accession.to_string());
                self.bump(format!("total_resolved_successfully_via{}", command.label()));
                tracing::info!(accession, via = command.label(), status = %terminal, "resolved");
                Ok(ResolveOutcome::Resolved(terminal.advertised(self.mode.is_dry_run())))
            }
            Err(err) if classify_failure(&err).is_fatal() => Err(err),
            Err(err) => {
                let reason = truncated_chain(&err, MAX_REASON_BYTES);
                if is_shape_error(&err) {
                    tracing::warn!(accession, via = command.label(), error = %reason, "cannot resolve");
                } else {
                    tracing::error!(accession, via = command.label(), error = %reason, "resolution failed");
                }
                self.bump(format!("errors_resolving_via{}", command.label()));
                Ok(ResolveOutcome::Failed(failure_status(resolve_via)))
            }
        }
    }

    fn apply(
        &self,
        ledger: &Ledger,
        accession: &str,
        attrs: &ModuleAttrs,
        command: &ResolveVia,
        current: &Status,
    ) -> Result<Status> {
        let mode = self.mode;
        let terminal = current.with_kind_preserving_context(command.terminal());
        match command {
            ResolveVia::MergeAtRadiology | ResolveVia::ResendRadiology => {
                ledger.retire_status_only(accession, None, mode)?;
                let retired = ledger.retire_stage_only(accession, None, false, mode)?;
                ledger.reactivate_manifest(accession, &terminal, Some(attrs), mode)?;
                ledger.delete_upstream_studies(accession, &retired, mode)?;
                Ok(terminal)
            }
            ResolveVia::ConsolidateLocally | ResolveVia::ChooseLocally { .. } => {
                let rows = ledger.active_status_rows(accession)?;
                let kept = choose_survivor(accession, command, &rows)?;
                if rows.len() == 1 {
                    tracing::info!(accession, "single active status row; normalising");
                }
                ledger.retire_status_only(accession, Some(kept.change_seq_id), mode)?;
                let retired =
                    ledger.retire_stage_only(accession, Some(kept.change_seq_id), false, mode)?;
                let terminal = if kept.phase_processed >= MIN_PHASE {
                    terminal
                } else {
                    current.with_kind_preserving_context(StatusKind::PendingChangeResolvedMultiuuids)
                };
                ledger.reactivate_manifest(accession, &terminal, Some(attrs), mode)?;
                ledger.delete_upstream_studies(accession, &retired, mode)?;
                Ok(terminal)
            }
            ResolveVia::DeleteScanLocally => {
                ledger.retire_with_tombstone(accession, Some(&terminal), mode)?;
                Ok(terminal)
            }
            ResolveVia::DeleteScanFromStageOnly => {
                ledger.retire_stage_only(accession, None, true, mode)?;
                Ok(terminal)
            }
        }
    }
}

fn choose_survivor<'a>(
    accession: &str,
    command: &ResolveVia,
    rows: &'a [StatusRow],
) -> Result<&'a StatusRow> {
    let shape_error = |reason: String| -> anyhow::Error {
        ProcessorError::Resolver {
            accession: accession.to_string(),
            command: command.label().to_string(),
            reason,
        }
        .into()
    };
    let candidates: Vec<&StatusRow> = match command {
        ResolveVia::ChooseLocally { uuid } => rows.iter().filter(|row| &row.uuid == uuid).collect(),
        _ => rows.iter().collect(),
    };
    let kept = candidates
        .iter()
        .max_by_key(|row| row.change_seq_id)
        .copied()
        .ok_or_else(|| shape_error("no matching active status row".to_string()))?;
    if matches!(command, ResolveVia::ConsolidateLocally) {
        let max_phase = rows
            .iter()
            .map(|row| row.phase_processed)
            .max()
            .unwrap_or(kept.phase_processed);
        if kept.phase_processed != max_phase {
            return Err(shape_error(format!(
                "latest change {} is at phase {} but another row reached phase {max_phase}; resolve manually (CHOOSE_LOCALLY)",
                kept.change_seq_id, kept.phase_processed
            )));
        }
    }
    Ok(kept)
}

fn failure_status(resolve_via: &str) -> Status {
    Status::with_suffix(
        StatusKind::ErrorResolvingMultiuuidCandidate,
        resolve_via.trim(),
    )
}

fn is_shape_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProcessorError>(),
        Some(ProcessorError::Resolver { .. })
    )
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
