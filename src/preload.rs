//! Preloading and presetting: put accessions on deck for a future run.
use crate::ledger::{Ledger, ModuleAttrs, StatusRow, WriteMode};
use crate::status::{Status, StatusKind, MAX_PHASE, MIN_PHASE};
use anyhow::Result;
use std::collections::BTreeSet;

/// How the summarizer prepares each input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    Preload { suffix: String, force_reprocess: bool },
    Preset { suffix: String },
}

/// Decide and apply the next status for `accession` given its ledger state.
///
/// Returns the status the accession now carries (or would carry, in dry-run).
pub fn preload(
    ledger: &Ledger,
    accession: &str,
    attrs: &ModuleAttrs,
    suffix: &str,
    force_reprocess: bool,
    mode: WriteMode,
) -> Result<Status> {
    let manifest = ledger.active_manifest(accession)?;
    let rows = ledger.active_status_rows(accession)?;
    let uuids: BTreeSet<&str> = rows.iter().map(|row| row.uuid.as_str()).collect();

    if rows.is_empty() {
        let status = Status::on_deck(StatusKind::PendingChange, suffix);
        ledger.reactivate_manifest(accession, &status, Some(attrs), mode)?;
        return Ok(status);
    }

    if uuids.len() > 1 {
        let status = Status::on_deck(StatusKind::ErrorMultipleChangeUuids, suffix);
        ledger.retire_status_only(accession, None, mode)?;
        for row in &rows {
            reinsert(ledger, accession, row, row.phase_processed, attrs, mode)?;
        }
        ledger.reactivate_manifest(accession, &status, Some(attrs), mode)?;
        return Ok(status);
    }

    // One uuid. Extra rows for the same uuid are older changes of it.
    let Some(latest) = rows.iter().max_by_key(|row| row.change_seq_id) else {
        return Ok(Status::not_found());
    };
    if rows.len() > 1 {
        ledger.retire_status_only(accession, Some(latest.change_seq_id), mode)?;
    }
    let manifest_processed = manifest
        .as_ref()
        .is_some_and(|row| row.status().is_processed());

    if latest.phase_processed >= MAX_PHASE || manifest_processed {
        if force_reprocess {
            let status = Status::on_deck(StatusKind::ReprocessingChange, suffix);
            ledger.retire_status_only(accession, None, mode)?;
            reinsert(ledger, accession, latest, MIN_PHASE, attrs, mode)?;
            ledger.reactivate_manifest(accession, &status, Some(attrs), mode)?;
            return Ok(status);
        }
        let current = manifest.map(|row| row.status());
        match current {
            Some(status) if status.is_processed() => {
                ledger.touch_manifest(accession, mode)?;
                return Ok(status);
            }
            _ if latest.phase_processed >= MAX_PHASE => {
                let status = Status::new(StatusKind::Processed);
                ledger.reactivate_manifest(accession, &status, None, mode)?;
                return Ok(status);
            }
            current => {
                ledger.touch_manifest(accession, mode)?;
                return Ok(current.unwrap_or_else(Status::not_found));
            }
        }
    }

    let status = Status::on_deck(StatusKind::ProcessingChange, suffix);
    ledger.reactivate_manifest(accession, &status, Some(attrs), mode)?;
    Ok(status)
}

fn reinsert(
    ledger: &Ledger,
    accession: &str,
    row: &StatusRow,
    phase: i64,
    attrs: &ModuleAttrs,
    mode: WriteMode,
) -> Result<()> {
    ledger.insert_status(
        accession,
        &row.uuid,
        row.change_seq_id.abs(),
        phase.clamp(MIN_PHASE, MAX_PHASE),
        attrs,
        mode,
    )
}

/// Mark a known accession for immediate reprocessing.
///
/// Pending accessions are left alone and `%MULTIPLE%` accessions (uuids or
/// splits) only have their timestamp advanced; everything else is rewound to the first phase.
pub fn preset(ledger: &Ledger, accession: &str, suffix: &str, mode: WriteMode) -> Result<Status> {
    let Some(manifest) = ledger.active_manifest(accession)? else {
        return Ok(Status::not_found());
    };
    let current = manifest.status();
    if current.kind.is_pending() || current.is_multiple_family() {
        ledger.touch_manifest(accession, mode)?;
        return Ok(current);
    }
    let status = Status::with_suffix(StatusKind::ReprocessingChangeMomentarily, suffix);
    ledger.reset_status_phases(accession, MIN_PHASE, mode)?;
    ledger.set_manifest_status(accession, &status, mode)?;
    Ok(status)
}

#[cfg(test)]
#[path = "preload_tests.rs"]
mod tests;
