//! The stager processing module: align an accession with the upstream stage
//! table, then walk its current change through the de-identification phases.
use super::{DeidPipeline, ModuleContext, OrthancPipeline, PhaseJob, ProcessOutcome, ProcessingModule};
use crate::config::{ModuleKind, StagerConfig};
use crate::errors::{classify_failure, truncated_chain, ProcessorError};
use crate::ledger::{Ledger, ModuleAttrs, StatusRow, WriteMode};
use crate::manifest_input::{read_manifest, ManifestInput};
use crate::secrets::required;
use crate::status::{Status, StatusKind, MAX_PHASE, MIN_PHASE};
use crate::util::stream_safe;
use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

const MAX_REASON_BYTES: usize = 160;

/// What one accession contributed to the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Nothing to do (already processed, or waiting on upstream).
    Idle,
    Succeeded,
    /// Counted as an error without failing the accession.
    Flagged,
}

#[derive(Debug, Clone)]
struct WorkItem {
    accession: String,
    attrs: ModuleAttrs,
    from_input: bool,
}

pub struct StagerModule {
    kind: ModuleKind,
    config: StagerConfig,
    pipeline: Option<Box<dyn DeidPipeline>>,
    ctx: Option<ModuleContext>,
    input: Option<ManifestInput>,
}

impl StagerModule {
    pub fn new(kind: ModuleKind, config: StagerConfig) -> Self {
        Self {
            kind,
            config,
            pipeline: None,
            ctx: None,
            input: None,
        }
    }

    /// Use `pipeline` instead of the Orthanc pipeline built at setup.
    #[cfg(test)]
    pub fn with_pipeline(mut self, pipeline: Box<dyn DeidPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    fn manifest_path(&self) -> Result<PathBuf> {
        if self.config.manifest_path.trim().is_empty() {
            return Err(ProcessorError::Config(format!(
                "{}_manifest_path is required when {}_process is on",
                self.kind, self.kind
            ))
            .into());
        }
        Ok(PathBuf::from(&self.config.manifest_path))
    }

    fn work_items(&self, ledger: &Ledger) -> Result<Vec<WorkItem>> {
        let mut items: Vec<WorkItem> = self
            .input
            .iter()
            .flat_map(|input| input.rows())
            .map(|row| WorkItem {
                accession: row.accession.clone(),
                attrs: row.attrs.clone(),
                from_input: true,
            })
            .collect();
        let listed: HashSet<String> = items.iter().map(|item| item.accession.clone()).collect();
        for row in ledger.active_manifest_rows()? {
            let status = row.status();
            if (status.is_on_deck() || status.is_momentarily()) && !listed.contains(&row.accession_num) {
                items.push(WorkItem {
                    accession: row.accession_num,
                    attrs: row.attrs,
                    from_input: false,
                });
            }
        }
        Ok(items)
    }

    fn prepare(&self, ledger: &Ledger, item: &WorkItem, mode: WriteMode) -> Result<()> {
        let accession = item.accession.as_str();
        if self.config.predelete_accession_status {
            tracing::info!(accession, "predelete");
            ledger.retire(accession, mode)?;
        } else if self.config.preretire_accession_status {
            tracing::info!(accession, "preretire");
            ledger.retire_status_only(accession, None, mode)?;
            ledger.retire_manifest_only(accession, mode)?;
        } else if self.config.force_reprocess_accession_status {
            let rows = ledger.active_status_rows(accession)?;
            if rows.is_empty() {
                return Ok(());
            }
            tracing::info!(accession, rows = rows.len(), "force reprocess");
            ledger.retire_status_only(accession, None, mode)?;
            for row in &rows {
                ledger.insert_status(
                    accession,
                    &row.uuid,
                    row.change_seq_id.abs(),
                    MIN_PHASE,
                    &item.attrs,
                    mode,
                )?;
            }
            ledger.reactivate_manifest(
                accession,
                &Status::new(StatusKind::ReprocessingChange),
                Some(&item.attrs),
                mode,
            )?;
        }
        Ok(())
    }

    fn process_accession(&self, ctx: &ModuleContext, item: &WorkItem) -> Result<Step> {
        let ledger = ctx.ledger.as_ref();
        let mode = ctx.mode;
        let accession = item.accession.as_str();
        self.prepare(ledger, item, mode)?;

        let current = ledger
            .active_manifest(accession)?
            .map(|row| row.status())
            .unwrap_or_else(Status::not_found);
        let changes = ledger.latest_stage_changes(accession)?;
        let rows = ledger.active_status_rows(accession)?;

        // Status rows may only name uuids that are still staged.
        let staged: HashSet<&str> = changes.iter().map(|change| change.uuid.as_str()).collect();
        let stale: BTreeSet<String> = rows
            .iter()
            .filter(|row| !staged.contains(row.uuid.as_str()))
            .map(|row| row.uuid.clone())
            .collect();
        for uuid in &stale {
            tracing::info!(accession, uuid = uuid.as_str(), "retiring status of an unstaged uuid");
            ledger.retire_status_uuid(accession, uuid, mode)?;
        }

        if changes.is_empty() {
            if !current.is_pending() {
                ledger.reactivate_manifest(
                    accession,
                    &Status::new(StatusKind::PendingChange),
                    Some(&item.attrs),
                    mode,
                )?;
            }
            return Ok(Step::Idle);
        }

        let rows: Vec<StatusRow> = rows
            .into_iter()
            .filter(|row| !stale.contains(row.uuid.as_str()))
            .collect();
        if changes.len() > 1 {
            let known: HashSet<&str> = rows.iter().map(|row| row.uuid.as_str()).collect();
            for change in changes.iter().filter(|c| !known.contains(c.uuid.as_str())) {
                ledger.insert_status(
                    accession,
                    &change.uuid,
                    change.change_seq_id,
                    MIN_PHASE,
                    &item.attrs,
                    mode,
                )?;
            }
            if !current.is_multiple() || current.is_on_deck() {
                ledger.reactivate_manifest(
                    accession,
                    &Status::new(StatusKind::ErrorMultipleChangeUuids),
                    Some(&item.attrs),
                    mode,
                )?;
            }
            tracing::warn!(accession, uuids = changes.len(), "accession staged under multiple uuids");
            return Ok(Step::Flagged);
        }

        let change = &changes[0];
        let is_current =
            |row: &StatusRow| row.uuid == change.uuid && row.change_seq_id == change.change_seq_id;
        if rows.iter().any(|row| !is_current(row)) {
            ledger.retire_status_only(accession, Some(change.change_seq_id), mode)?;
        }
        let row = match rows.iter().find(|row| is_current(row)) {
            Some(row) => row.clone(),
            None => {
                ledger.insert_status(
                    accession,
                    &change.uuid,
                    change.change_seq_id,
                    MIN_PHASE,
                    &item.attrs,
                    mode,
                )?;
                StatusRow {
                    accession_num: accession.to_string(),
                    uuid: change.uuid.clone(),
                    change_seq_id: change.change_seq_id,
                    phase_processed: MIN_PHASE,
                    attrs: item.attrs.clone(),
                    ..StatusRow::default()
                }
            }
        };

        if row.phase_processed >= MAX_PHASE {
            if current.is_processed() {
                return Ok(Step::Idle);
            }
            ledger.reactivate_manifest(
                accession,
                &Status::new(StatusKind::Processed),
                Some(&item.attrs),
                mode,
            )?;
            return Ok(Step::Succeeded);
        }

        if self.config.alignment_mode {
            if current.kind != StatusKind::ProcessingChangeMomentarily || current.is_on_deck() {
                ledger.reactivate_manifest(
                    accession,
                    &Status::new(StatusKind::ProcessingChangeMomentarily),
                    Some(&item.attrs),
                    mode,
                )?;
            }
            return Ok(Step::Idle);
        }

        let running = match current.kind {
            StatusKind::ReprocessingChange | StatusKind::ReprocessingChangeMomentarily => {
                StatusKind::ReprocessingChange
            }
            _ => StatusKind::ProcessingChange,
        };
        ledger.reactivate_manifest(accession, &Status::new(running), Some(&item.attrs), mode)?;

        if mode.is_dry_run() {
            tracing::info!(accession, from_phase = row.phase_processed, "dry-run; pipeline skipped");
        } else {
            self.run_pipeline(ledger, accession, &row, mode)?;
        }
        ledger.set_manifest_status(accession, &Status::new(StatusKind::Processed), mode)?;
        Ok(Step::Succeeded)
    }

    fn run_pipeline(
        &self,
        ledger: &Ledger,
        accession: &str,
        row: &StatusRow,
        mode: WriteMode,
    ) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("{} pipeline not set up", self.kind))?;
        let mut job = PhaseJob {
            accession: accession.to_string(),
            uuid: row.uuid.clone(),
            subject_id: row.attrs.subject_id.clone(),
            targets: row.deidentified_targets.clone(),
        };
        for phase in (row.phase_processed + 1)..=MAX_PHASE {
            let started = Instant::now();
            job.targets = pipeline.run_phase(&job, phase)?;
            ledger.set_status_phase(accession, row.change_seq_id, phase, &job.targets, mode)?;
            tracing::debug!(
                accession,
                phase,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "phase complete"
            );
        }
        Ok(())
    }

    /// Write `ERROR_PROCESSING_CHANGE:<reason>` and return the failure as recorded.
    fn record_failure(
        &self,
        ctx: &ModuleContext,
        item: &WorkItem,
        err: &anyhow::Error,
    ) -> Result<ProcessorError> {
        let reason = stream_safe(&truncated_chain(err, MAX_REASON_BYTES));
        let status = Status::with_suffix(StatusKind::ErrorProcessingChange, reason.as_str());
        ctx.ledger
            .reactivate_manifest(&item.accession, &status, Some(&item.attrs), ctx.mode)?;
        Ok(ProcessorError::ModuleProcessing {
            accession: item.accession.clone(),
            reason,
        })
    }
}

impl ProcessingModule for StagerModule {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        if ctx.kind != self.kind {
            return Err(ProcessorError::Config(format!(
                "{} module bound to the {} ledger",
                self.kind, ctx.kind
            ))
            .into());
        }
        let path = self.manifest_path()?;
        if self.pipeline.is_none() {
            let target_root = required(&ctx.secrets, &self.config.vault_path, "target_root")?;
            self.pipeline = Some(Box::new(OrthancPipeline::new(
                Rc::clone(ctx.ledger.upstream()),
                target_root,
                self.config.use_zip_archive_structure,
            )));
        }
        self.input = Some(read_manifest(&path, self.kind, false)?);
        tracing::info!(
            module = self.name(),
            manifest = %path.display(),
            rows = self.input.as_ref().map_or(0, |input| input.rows().count()),
            "stager ready"
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    fn process(&mut self) -> Result<ProcessOutcome> {
        let ctx = self
            .ctx
            .clone()
            .ok_or_else(|| anyhow!("{} processed before setup", self.kind))?;
        let started = Instant::now();
        let mut outcome = ProcessOutcome::default();
        let mut seen = HashSet::new();

        for item in self.work_items(&ctx.ledger)? {
            if let Some(scope) = ctx.gate.closed_scope()? {
                tracing::error!(module = self.name(), %scope, "system status inactive; stopping");
                outcome.fatal = true;
                break;
            }
            if !seen.insert(item.accession.clone()) && !self.config.allow_processing_of_duplicates {
                tracing::warn!(accession = item.accession.as_str(), "duplicate input row skipped");
                continue;
            }
            match self.process_accession(&ctx, &item) {
                Ok(Step::Idle) => {}
                Ok(Step::Succeeded) => outcome.succeeded += 1,
                Ok(Step::Flagged) => outcome.errors += 1,
                Err(err) => {
                    let class = classify_failure(&err);
                    tracing::error!(
                        accession = item.accession.as_str(),
                        input = item.from_input,
                        class = ?class,
                        error = %truncated_chain(&err, MAX_REASON_BYTES),
                        "accession failed"
                    );
                    if class.is_fatal() {
                        outcome.errors += 1;
                        outcome.fatal = true;
                        break;
                    }
                    let failure = self.record_failure(&ctx, &item, &err)?;
                    tracing::warn!(
                        module = self.name(),
                        counted = !self.config.force_success,
                        "{failure}"
                    );
                    if !self.config.force_success {
                        outcome.errors += 1;
                    }
                }
            }
        }

        tracing::info!(
            module = self.name(),
            succeeded = outcome.succeeded,
            errors = outcome.errors,
            fatal = outcome.fatal,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pass complete"
        );
        Ok(outcome)
    }

    fn setup_input_manifest(&mut self, iteration: u32) -> Result<()> {
        let path = self.manifest_path()?;
        tracing::debug!(module = self.name(), iteration, "re-reading input manifest");
        self.input = Some(read_manifest(&path, self.kind, false)?);
        Ok(())
    }

    fn clear_preparation_flags(&mut self) {
        self.config.force_reprocess_accession_status = false;
        self.config.predelete_accession_status = false;
        self.config.preretire_accession_status = false;
    }
}

#[cfg(test)]
#[path = "stager_tests.rs"]
mod tests;
