//! Reconcile an input list against the ledger.
//!
//! One `MANIFEST_OUTPUT:` line per input row, then a `# STATUS_OUT:` tally.
//! Read-only unless one of resolve / preload / preset is enabled, in that
//! priority order.
use crate::config::SummarizerConfig;
use crate::errors::{classify_failure, is_invalid_credential, truncated_chain, ProcessorError};
use crate::ledger::{Ledger, StatusRow};
use crate::manifest_input::{read_manifest, InputLine, InputRow, ManifestInput};
use crate::module::{Command, CommandOutcome, ModuleContext};
use crate::preload::{preload, preset, Preparation};
use crate::resolver::Resolver;
use crate::status::{Status, StatusBucket, BUCKET_ORDER};
use crate::upstream::StudySummary;
use crate::util::{now_timestamp, stream_safe};
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

pub const DUPLICATE_MARKER: &str = "WARNING:duplicates";
const MULTIUUID_SEPARATOR: &str = "----";
const MAX_REASON_BYTES: usize = 160;

#[derive(Debug, Default)]
struct Tally {
    rows: u64,
    duplicates: u64,
    buckets: BTreeMap<StatusBucket, u64>,
}

impl Tally {
    fn count(&mut self, status: &Status) {
        self.rows += 1;
        *self.buckets.entry(status.bucket()).or_insert(0) += 1;
    }
}

pub struct Summarizer {
    config: SummarizerConfig,
    /// The target module's `force_reprocess_accession_status`.
    force_reprocess: bool,
    ctx: Option<ModuleContext>,
    input: Option<ManifestInput>,
}

impl Summarizer {
    pub fn new(config: SummarizerConfig, force_reprocess: bool) -> Self {
        Self {
            config,
            force_reprocess,
            ctx: None,
            input: None,
        }
    }

    fn preparation(&self) -> Option<Preparation> {
        if self.config.preload_enable {
            Some(Preparation::Preload {
                suffix: self.config.preload_suffix.clone(),
                force_reprocess: self.force_reprocess,
            })
        } else if self.config.preset_enable {
            Some(Preparation::Preset {
                suffix: self.config.preset_suffix.clone(),
            })
        } else {
            None
        }
    }

    fn emit_header(&self, ctx: &ModuleContext, input: &ManifestInput) -> Result<()> {
        let streams = &ctx.streams;
        let tables = ctx.ledger.tables();
        let workspace = if ctx.workspace_name.is_empty() {
            "(default)"
        } else {
            ctx.workspace_name.as_str()
        };
        let job = stream_safe(&self.config.job_description);
        streams.manifest_comment(&format!("JOB_DESCRIPTION: {job}"));
        streams.manifest_comment(&format!("INPUT: {}", input.name));
        streams.manifest_comment(&format!("TIMESTAMP: {}", now_timestamp()));
        streams.manifest_comment(&format!("APP_VERSION: {}", env!("CARGO_PKG_VERSION")));
        streams.manifest_comment(&format!("MODULE: {}", self.config.module));
        streams.manifest_comment(&format!("WORKSPACE: {workspace}"));
        streams.manifest_comment(&format!("MANIFEST_TABLE: {}", tables.manifest));
        streams.manifest_comment(&format!("STATUS_TABLE: {}", tables.status));
        streams.manifest_comment(&format!("STAGE_TABLE: {}", tables.stage_studies));
        streams.manifest_comment(&format!(
            "DISTINCT_ACCESSIONS: {}",
            ctx.ledger.distinct_accession_count()?
        ));
        let flags = [
            ("enable_db_updates", !ctx.mode.is_dry_run()),
            ("show_multiuuids", self.config.show_multiuuids),
            ("resolve_multiuuids", self.config.resolve_multiuuids),
            ("preload_enable", self.config.preload_enable),
            ("preset_enable", self.config.preset_enable),
            ("force_reprocess_accession_status", self.force_reprocess),
        ];
        for (name, value) in flags {
            streams.manifest_comment(&format!("FLAG: {name}={value}"));
        }

        let mut columns: Vec<&str> = input.header_columns();
        if input.resolver {
            columns.push(crate::manifest_input::RESOLVE_VIA_COLUMN);
        }
        columns.extend(["DUPLICATE", "STATUS", "LAST_PROCESSED", "LATEST_TARGET"]);
        streams.manifest(&columns);
        Ok(())
    }

    /// Apply the enabled action (if any) and return the status to report.
    fn act(
        &self,
        ctx: &ModuleContext,
        resolver: &mut Resolver,
        row: &InputRow,
        current: Status,
    ) -> Result<Status> {
        let ledger = ctx.ledger.as_ref();
        let dry_run = ctx.mode.is_dry_run();
        if let Some(resolve_via) = row.resolve_via.as_deref() {
            let outcome = resolver.resolve(ledger, &row.accession, &row.attrs, resolve_via)?;
            return Ok(outcome.status().clone());
        }
        let status = match self.preparation() {
            Some(Preparation::Preload {
                suffix,
                force_reprocess,
            }) => preload(ledger, &row.accession, &row.attrs, &suffix, force_reprocess, ctx.mode)?,
            Some(Preparation::Preset { suffix }) => {
                preset(ledger, &row.accession, &suffix, ctx.mode)?
            }
            None => return Ok(current),
        };
        Ok(status.advertised(dry_run))
    }

    fn emit_inspect_lines(&self, ctx: &ModuleContext, rows: &[StatusRow]) {
        let uuids: BTreeSet<&str> = rows.iter().map(|row| row.uuid.as_str()).collect();
        for uuid in uuids {
            ctx.streams.orthanc(&ctx.ledger.upstream().inspect_command(uuid));
        }
    }

    fn expand_multiuuids(&self, ctx: &ModuleContext, accession: &str, rows: &[StatusRow]) -> Result<()> {
        for row in rows {
            match ctx.ledger.upstream().describe_study(&row.uuid) {
                Ok(summary) => ctx.streams.manifest_comment(&describe(accession, row, &summary)),
                Err(err) if is_invalid_credential(&err) => return Err(err),
                Err(err) => {
                    tracing::warn!(accession, uuid = row.uuid.as_str(), error = %err, "study metadata unavailable");
                    ctx.streams.manifest_comment(&format!(
                        "{accession},uuid={},change_seq_id={},phase={},unavailable: {}",
                        row.uuid,
                        row.change_seq_id,
                        row.phase_processed,
                        stream_safe(&truncated_chain(&err, 120))
                    ));
                }
            }
        }
        ctx.streams.manifest_comment(MULTIUUID_SEPARATOR);
        Ok(())
    }

    fn emit_tally(&self, ctx: &ModuleContext, tally: &Tally, resolver: &Resolver) -> Result<()> {
        let streams = &ctx.streams;
        streams.manifest_comment(&format!("STATUS_OUT: ROWS,{}", tally.rows));
        for bucket in BUCKET_ORDER {
            let count = tally.buckets.get(&bucket).copied().unwrap_or(0);
            streams.manifest_comment(&format!("STATUS_OUT: {bucket},{count}"));
        }
        streams.manifest_comment(&format!("STATUS_OUT: DUPLICATES,{}", tally.duplicates));
        for (name, count) in resolver.counters() {
            streams.manifest_comment(&format!("STATUS_OUT: RESOLVER,{name},{count}"));
        }
        for (status, count) in ctx.ledger.distinct_status_counts()? {
            streams.manifest_comment(&format!("STATUS_OUT: LEDGER,{},{count}", stream_safe(&status)));
        }
        Ok(())
    }
}

fn describe(accession: &str, row: &StatusRow, summary: &StudySummary) -> String {
    let mut fields = vec![
        accession.to_string(),
        format!("uuid={}", row.uuid),
        format!("change_seq_id={}", row.change_seq_id),
        format!("phase={}", row.phase_processed),
        format!("study_date={}", summary.study_date),
        format!("institution={}", stream_safe(&summary.institution)),
        format!("series={}", summary.series_count),
        format!("instances={}", summary.instance_count),
        format!("modality={}", summary.modality),
        format!("manufacturer={}", stream_safe(&summary.manufacturer)),
        format!("description={}", stream_safe(&summary.description)),
    ];
    if let Some(number) = &summary.acquisition_number {
        fields.push(format!("acquisition_number={number}"));
    }
    if let Some(number) = &summary.instance_number {
        fields.push(format!("instance_number={number}"));
    }
    fields.join(",")
}

fn latest_target(rows: &[StatusRow]) -> String {
    rows.iter()
        .max_by_key(|row| row.change_seq_id)
        .and_then(StatusRow::latest_target)
        .unwrap_or_default()
        .to_string()
}

fn current_status(ledger: &Ledger, accession: &str) -> Result<(Status, String)> {
    Ok(match ledger.active_manifest(accession)? {
        Some(row) => (row.status(), row.last_datetime_processed),
        None => (Status::not_found(), String::new()),
    })
}

impl Command for Summarizer {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        if self.config.preload_enable && self.config.preset_enable {
            return Err(ProcessorError::Config(
                "summarizer_preload_enable and summarizer_preset_enable are mutually exclusive"
                    .to_string(),
            )
            .into());
        }
        if self.config.manifest_path.trim().is_empty() {
            return Err(ProcessorError::Config(
                "summarizer_manifest_path is required when summarizer_process is on".to_string(),
            )
            .into());
        }
        let path = PathBuf::from(&self.config.manifest_path);
        let input = read_manifest(&path, self.config.module, self.config.resolve_multiuuids)?;
        tracing::info!(
            manifest = %path.display(),
            rows = input.rows().count(),
            resolver = input.resolver,
            "summarizer ready"
        );
        self.input = Some(input);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn run(&mut self) -> Result<CommandOutcome> {
        let (Some(ctx), Some(input)) = (self.ctx.as_ref(), self.input.as_ref()) else {
            return Err(anyhow!("summarizer run before setup"));
        };
        let mut resolver = Resolver::new(ctx.mode);
        let mut tally = Tally::default();
        let mut seen = HashSet::new();
        let mut row_errors = 0;

        self.emit_header(ctx, input)?;
        for line in &input.lines {
            let row = match line {
                InputLine::Comment(text) => {
                    ctx.streams.manifest_comment(text);
                    continue;
                }
                InputLine::Row(row) => row,
            };
            let accession = row.accession.as_str();
            let duplicate = !seen.insert(accession.to_string());
            let (current, _) = current_status(&ctx.ledger, accession)?;
            let status = if duplicate {
                tally.duplicates += 1;
                tracing::warn!(accession, line = row.line_no, "duplicate input row");
                current
            } else {
                match self.act(ctx, &mut resolver, row, current) {
                    Ok(status) => status,
                    Err(err) if classify_failure(&err).is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::error!(
                            accession,
                            line = row.line_no,
                            error = %truncated_chain(&err, MAX_REASON_BYTES),
                            "row failed; carrying on"
                        );
                        row_errors += 1;
                        current_status(&ctx.ledger, accession)?.0
                    }
                }
            };

            let (_, last_processed) = current_status(&ctx.ledger, accession)?;
            let rows = ctx.ledger.active_status_rows(accession)?;
            self.emit_inspect_lines(ctx, &rows);

            let mut columns = row.columns.clone();
            if input.resolver {
                columns.push(row.resolve_via.clone().unwrap_or_default());
            }
            columns.push(if duplicate { DUPLICATE_MARKER } else { "" }.to_string());
            columns.push(status.to_string());
            columns.push(last_processed);
            columns.push(latest_target(&rows));
            ctx.streams.manifest(&columns);

            if duplicate {
                tally.rows += 1;
                continue;
            }
            if self.config.show_multiuuids && status.is_multiple() {
                self.expand_multiuuids(ctx, accession, &rows)?;
            }
            tally.count(&status);
        }
        self.emit_tally(ctx, &tally, &resolver)?;

        let errors = resolver.error_count() + row_errors;
        tracing::info!(
            rows = tally.rows,
            duplicates = tally.duplicates,
            errors,
            "summary complete"
        );
        Ok(CommandOutcome { errors })
    }
}

#[cfg(test)]
#[path = "summarizer_tests.rs"]
mod tests;
