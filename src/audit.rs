//! Read-only audits run alongside the summarizer on the first iteration.
use crate::config::AuditConfig;
use crate::ledger::{Ledger, StatusRow};
use crate::module::{Command, CommandOutcome, ModuleContext};
use crate::status::{MAX_PHASE, MIN_PHASE};
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};

fn status_rows_by_accession(ledger: &Ledger) -> Result<BTreeMap<String, Vec<StatusRow>>> {
    let mut grouped: BTreeMap<String, Vec<StatusRow>> = BTreeMap::new();
    for row in ledger.all_active_status_rows()? {
        grouped.entry(row.accession_num.clone()).or_default().push(row);
    }
    Ok(grouped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Alignment {
    InSync,
    NotStaged,
    /// The stage holds a change the status table has not picked up.
    StageAhead,
    /// A status uuid has no active stage row.
    StatusOrphaned,
}

impl Alignment {
    fn as_str(&self) -> &'static str {
        match self {
            Alignment::InSync => "IN_SYNC",
            Alignment::NotStaged => "NOT_STAGED",
            Alignment::StageAhead => "STAGE_AHEAD",
            Alignment::StatusOrphaned => "STATUS_ORPHANED",
        }
    }
}

/// Compare each active accession's status rows with the upstream stage.
pub struct StageCompare {
    config: AuditConfig,
    ctx: Option<ModuleContext>,
}

impl StageCompare {
    pub fn new(config: AuditConfig) -> Self {
        Self { config, ctx: None }
    }
}

impl Command for StageCompare {
    fn name(&self) -> &str {
        "stage_compare"
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        tracing::debug!(module = %self.config.module, "stage compare ready");
        self.ctx = Some(ctx);
        Ok(())
    }

    fn run(&mut self) -> Result<CommandOutcome> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| anyhow!("stage compare run before setup"))?;
        let ledger = ctx.ledger.as_ref();
        let status_rows = status_rows_by_accession(ledger)?;
        let mut counts: BTreeMap<Alignment, u64> = BTreeMap::new();

        for manifest in ledger.active_manifest_rows()? {
            let accession = manifest.accession_num.as_str();
            let staged: BTreeSet<(String, i64)> = ledger
                .latest_stage_changes(accession)?
                .into_iter()
                .map(|row| (row.uuid, row.change_seq_id))
                .collect();
            let tracked: BTreeSet<(String, i64)> = status_rows
                .get(accession)
                .into_iter()
                .flatten()
                .map(|row| (row.uuid.clone(), row.change_seq_id))
                .collect();
            let staged_uuids: BTreeSet<&str> = staged.iter().map(|(uuid, _)| uuid.as_str()).collect();

            let alignment = if tracked.iter().any(|(uuid, _)| !staged_uuids.contains(uuid.as_str())) {
                Alignment::StatusOrphaned
            } else if staged.is_empty() {
                Alignment::NotStaged
            } else if staged.is_subset(&tracked) {
                Alignment::InSync
            } else {
                Alignment::StageAhead
            };
            *counts.entry(alignment).or_insert(0) += 1;
            if alignment != Alignment::InSync {
                ctx.streams.manifest_comment(&format!(
                    "STAGE_COMPARE: {accession},{},{},staged={},tracked={}",
                    manifest.manifest_status,
                    alignment.as_str(),
                    render(&staged),
                    render(&tracked)
                ));
            }
        }
        for (alignment, count) in &counts {
            ctx.streams
                .manifest_comment(&format!("STAGE_COMPARE_OUT: {},{count}", alignment.as_str()));
        }
        tracing::info!(accessions = counts.values().sum::<u64>(), "stage compare complete");
        Ok(CommandOutcome::default())
    }
}

fn render(changes: &BTreeSet<(String, i64)>) -> String {
    changes
        .iter()
        .map(|(uuid, seq)| format!("{uuid}@{seq}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ledger consistency checks; every violation counts as one error.
pub struct Qc {
    config: AuditConfig,
    ctx: Option<ModuleContext>,
}

impl Qc {
    pub fn new(config: AuditConfig) -> Self {
        Self { config, ctx: None }
    }
}

struct Findings<'a> {
    ctx: &'a ModuleContext,
    counts: BTreeMap<&'static str, u64>,
}

impl Findings<'_> {
    fn report(&mut self, check: &'static str, accession: &str, detail: String) {
        *self.counts.entry(check).or_insert(0) += 1;
        self.ctx
            .streams
            .manifest_comment(&format!("QC: {check},{accession},{detail}"));
    }

    fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Command for Qc {
    fn name(&self) -> &str {
        "qc"
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        tracing::debug!(module = %self.config.module, "qc ready");
        self.ctx = Some(ctx);
        Ok(())
    }

    fn run(&mut self) -> Result<CommandOutcome> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| anyhow!("qc run before setup"))?;
        let ledger = ctx.ledger.as_ref();
        let status_rows = status_rows_by_accession(ledger)?;
        let mut findings = Findings {
            ctx,
            counts: BTreeMap::new(),
        };

        for (accession, count) in ledger.duplicate_active_manifests()? {
            findings.report("duplicate_active_manifest", &accession, format!("rows={count}"));
        }
        for row in status_rows.values().flatten() {
            if !(MIN_PHASE..=MAX_PHASE).contains(&row.phase_processed) {
                findings.report(
                    "phase_out_of_range",
                    &row.accession_num,
                    format!("uuid={},phase={}", row.uuid, row.phase_processed),
                );
            }
        }
        for manifest in ledger.active_manifest_rows()? {
            let accession = manifest.accession_num.as_str();
            let status = manifest.status();
            let rows = status_rows.get(accession).map(Vec::as_slice).unwrap_or(&[]);

            if status.is_processed() {
                if let Some(row) = rows.iter().find(|row| row.phase_processed != MAX_PHASE) {
                    findings.report(
                        "processed_with_unfinished_status",
                        accession,
                        format!("uuid={},phase={}", row.uuid, row.phase_processed),
                    );
                }
            }
            if (rows.len() > 1) != status.is_multiple() {
                findings.report(
                    "multiple_status_mismatch",
                    accession,
                    format!("status={},active_rows={}", manifest.manifest_status, rows.len()),
                );
            }
            let staged: BTreeSet<String> = ledger
                .active_stage_rows(accession)?
                .into_iter()
                .map(|row| row.uuid)
                .collect();
            for row in rows.iter().filter(|row| !staged.contains(&row.uuid)) {
                findings.report("status_uuid_not_staged", accession, format!("uuid={}", row.uuid));
            }
        }

        for (check, count) in &findings.counts {
            ctx.streams.manifest_comment(&format!("QC_OUT: {check},{count}"));
        }
        let errors = findings.total();
        if errors > 0 {
            tracing::warn!(violations = errors, "ledger qc found violations");
        } else {
            tracing::info!("ledger qc clean");
        }
        Ok(CommandOutcome { errors })
    }
}
