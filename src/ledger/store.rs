use super::{Database, ManifestRow, ModuleAttrs, Sql, StageRow, StatusRow, TableNames, WriteMode};
use crate::status::Status;
use crate::streams::Streams;
use crate::upstream::UpstreamStore;
use crate::util::now_timestamp;
use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Typed access to one module's ledger tables.
///
/// Mutators print a commented pre-image `SELECT` and then the statement on the
/// `SQL_OUT:` stream before executing; under [`WriteMode::DryRun`] only the
/// pre-image query runs.
pub struct Ledger {
    db: Rc<Database>,
    tables: TableNames,
    streams: Streams,
    upstream: Rc<dyn UpstreamStore>,
}

impl Ledger {
    /// Install the module's tables (idempotent) and bind the store to them.
    pub fn open(
        db: Rc<Database>,
        tables: TableNames,
        streams: Streams,
        upstream: Rc<dyn UpstreamStore>,
    ) -> Result<Self> {
        tables.install(db.conn())?;
        Ok(Self {
            db,
            tables,
            streams,
            upstream,
        })
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn upstream(&self) -> &Rc<dyn UpstreamStore> {
        &self.upstream
    }

    pub fn active_manifest(&self, accession: &str) -> Result<Option<ManifestRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE accession_num = ?1 AND active = 1",
            ManifestRow::COLUMNS,
            self.tables.manifest
        );
        let row = self
            .db
            .conn()
            .query_row(&sql, [accession], ManifestRow::from_row)
            .optional()
            .with_context(|| format!("read manifest for {accession}"))?;
        Ok(row)
    }

    /// Every active manifest row, oldest first.
    pub fn active_manifest_rows(&self) -> Result<Vec<ManifestRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE active = 1 ORDER BY id",
            ManifestRow::COLUMNS,
            self.tables.manifest
        );
        self.collect(&sql, &[], ManifestRow::from_row)
            .context("read active manifest rows")
    }

    /// Active status rows for one accession, ordered by change sequence.
    pub fn active_status_rows(&self, accession: &str) -> Result<Vec<StatusRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE accession_num = ?1 AND active = 1 ORDER BY change_seq_id, id",
            StatusRow::COLUMNS,
            self.tables.status
        );
        self.collect(&sql, &[accession], StatusRow::from_row)
            .with_context(|| format!("read status rows for {accession}"))
    }

    pub fn all_active_status_rows(&self) -> Result<Vec<StatusRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE active = 1 ORDER BY accession_num, change_seq_id",
            StatusRow::COLUMNS,
            self.tables.status
        );
        self.collect(&sql, &[], StatusRow::from_row)
            .context("read active status rows")
    }

    pub fn active_stage_rows(&self, accession: &str) -> Result<Vec<StageRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE accession_str = ?1 AND active = 1 ORDER BY change_seq_id, id",
            StageRow::COLUMNS,
            self.tables.stage_studies
        );
        self.collect(&sql, &[accession], StageRow::from_row)
            .with_context(|| format!("read stage rows for {accession}"))
    }

    /// The latest staged change for each distinct active uuid.
    pub fn latest_stage_changes(&self, accession: &str) -> Result<Vec<StageRow>> {
        let mut latest: Vec<StageRow> = Vec::new();
        for row in self.active_stage_rows(accession)? {
            match latest.iter_mut().find(|kept| kept.uuid == row.uuid) {
                Some(kept) if kept.change_seq_id < row.change_seq_id => *kept = row,
                Some(_) => {}
                None => latest.push(row),
            }
        }
        Ok(latest)
    }

    pub fn distinct_accession_count(&self) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(DISTINCT accession_num) FROM {} WHERE active = 1",
            self.tables.manifest
        );
        let count = self
            .db
            .conn()
            .query_row(&sql, [], |row| row.get(0))
            .context("count distinct accessions")?;
        Ok(count)
    }

    /// Active manifest statuses grouped on their first 100 characters.
    pub fn distinct_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT substr(manifest_status, 1, 100) AS status, COUNT(*) FROM {}
             WHERE active = 1 GROUP BY status ORDER BY status",
            self.tables.manifest
        );
        self.collect(&sql, &[], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("count distinct statuses")
    }

    /// Accessions holding more than one active manifest row.
    pub fn duplicate_active_manifests(&self) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT accession_num, COUNT(*) AS n FROM {} WHERE active = 1
             GROUP BY accession_num HAVING n > 1 ORDER BY accession_num",
            self.tables.manifest
        );
        self.collect(&sql, &[], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("find duplicate active manifest rows")
    }

    fn collect<T, F>(&self, sql: &str, params: &[&str], map: F) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.db.conn().prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), map)?
            .collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(rows)
    }

    fn mutate(&self, mode: WriteMode, pre_image: &Sql, statement: &Sql) -> Result<usize> {
        let count_sql = format!("SELECT COUNT(*) FROM ({})", pre_image.sql());
        let count: i64 = self
            .db
            .conn()
            .query_row(&count_sql, pre_image.params(), |row| row.get(0))
            .with_context(|| format!("pre-image {}", pre_image.rendered()))?;
        self.streams
            .sql_comment(&format!("{}; -- {count} row(s)", pre_image.rendered()));
        self.streams.sql(&format!("{};", statement.rendered()));
        if mode.is_dry_run() {
            return Ok(0);
        }
        let changed = self
            .db
            .conn()
            .execute(statement.sql(), statement.params())
            .with_context(|| format!("execute {}", statement.rendered()))?;
        Ok(changed)
    }

    fn manifest_pre_image(&self, accession: &str) -> Sql {
        Sql::new(format!(
            "SELECT id, accession_num, manifest_status, last_datetime_processed FROM {} WHERE accession_num = ?1 AND active = 1",
            self.tables.manifest
        ))
        .text(accession)
    }

    fn status_pre_image(&self, accession: &str) -> Sql {
        Sql::new(format!(
            "SELECT id, uuid, change_seq_id, phase_processed FROM {} WHERE accession_num = ?1 AND active = 1",
            self.tables.status
        ))
        .text(accession)
    }

    /// Retire the active manifest row: `active = 0` and a `-` prefix.
    pub fn retire_manifest_only(&self, accession: &str, mode: WriteMode) -> Result<usize> {
        let statement = Sql::new(format!(
            "UPDATE {} SET active = 0, accession_num = '-' || accession_num, last_datetime_processed = ?2
             WHERE accession_num = ?1 AND active = 1",
            self.tables.manifest
        ))
        .text(accession)
        .text(&now_timestamp());
        self.mutate(mode, &self.manifest_pre_image(accession), &statement)
    }

    /// Retire active status rows, optionally keeping the row with `except`.
    pub fn retire_status_only(
        &self,
        accession: &str,
        except_change_seq: Option<i64>,
        mode: WriteMode,
    ) -> Result<usize> {
        let (filter, pre_image) = match except_change_seq {
            Some(seq) => (
                " AND change_seq_id <> ?3",
                Sql::new(format!("{} AND change_seq_id <> ?2", self.status_pre_image(accession).sql()))
                    .text(accession)
                    .int(seq),
            ),
            None => ("", self.status_pre_image(accession)),
        };
        let mut statement = Sql::new(format!(
            "UPDATE {} SET active = 0, accession_num = '-' || accession_num,
             change_seq_id = -abs(change_seq_id), datetime_processed = ?2
             WHERE accession_num = ?1 AND active = 1{filter}",
            self.tables.status
        ))
        .text(accession)
        .text(&now_timestamp());
        if let Some(seq) = except_change_seq {
            statement = statement.int(seq);
        }
        self.mutate(mode, &pre_image, &statement)
    }

    /// Retire the active status rows recorded under one `uuid`.
    pub fn retire_status_uuid(&self, accession: &str, uuid: &str, mode: WriteMode) -> Result<usize> {
        let pre_image = Sql::new(format!("{} AND uuid = ?2", self.status_pre_image(accession).sql()))
            .text(accession)
            .text(uuid);
        let statement = Sql::new(format!(
            "UPDATE {} SET active = 0, accession_num = '-' || accession_num,
             change_seq_id = -abs(change_seq_id), datetime_processed = ?3
             WHERE accession_num = ?1 AND uuid = ?2 AND active = 1",
            self.tables.status
        ))
        .text(accession)
        .text(uuid)
        .text(&now_timestamp());
        self.mutate(mode, &pre_image, &statement)
    }

    /// Retire active stage rows, then (optionally) delete the retired uuids
    /// upstream. Returns the uuids that were retired.
    pub fn retire_stage_only(
        &self,
        accession: &str,
        except_change_seq: Option<i64>,
        delete_upstream: bool,
        mode: WriteMode,
    ) -> Result<Vec<String>> {
        let rows = self.active_stage_rows(accession)?;
        let (retired, kept): (Vec<&StageRow>, Vec<&StageRow>) = rows
            .iter()
            .partition(|row| Some(row.change_seq_id) != except_change_seq);
        let kept_uuids: BTreeSet<&str> = kept.iter().map(|row| row.uuid.as_str()).collect();
        let retired_uuids: BTreeSet<String> = retired
            .iter()
            .map(|row| row.uuid.clone())
            .filter(|uuid| !kept_uuids.contains(uuid.as_str()))
            .collect();

        let base_pre_image = format!(
            "SELECT id, uuid, change_seq_id FROM {} WHERE accession_str = ?1 AND active = 1",
            self.tables.stage_studies
        );
        let base_update = format!(
            "UPDATE {} SET active = 0, accession_str = '-' || accession_str,
             change_seq_id = -abs(change_seq_id)
             WHERE accession_str = ?1 AND active = 1",
            self.tables.stage_studies
        );
        let (pre_image, statement) = match except_change_seq {
            Some(seq) => (
                Sql::new(format!("{base_pre_image} AND change_seq_id <> ?2"))
                    .text(accession)
                    .int(seq),
                Sql::new(format!("{base_update} AND change_seq_id <> ?2"))
                    .text(accession)
                    .int(seq),
            ),
            None => (
                Sql::new(base_pre_image).text(accession),
                Sql::new(base_update).text(accession),
            ),
        };
        self.mutate(mode, &pre_image, &statement)?;

        let retired_uuids: Vec<String> = retired_uuids.into_iter().collect();
        if delete_upstream {
            self.delete_upstream_studies(accession, &retired_uuids, mode)?;
        }
        Ok(retired_uuids)
    }

    /// Delete retired studies upstream, printing each command first.
    pub fn delete_upstream_studies(
        &self,
        accession: &str,
        uuids: &[String],
        mode: WriteMode,
    ) -> Result<()> {
        for uuid in uuids {
            self.streams.orthanc(&self.upstream.delete_command(uuid));
            if mode.is_dry_run() {
                continue;
            }
            self.upstream
                .delete_study(uuid)
                .with_context(|| format!("delete upstream study {uuid} for {accession}"))?;
            tracing::info!(accession, uuid = uuid.as_str(), "upstream study deleted");
        }
        Ok(())
    }

    /// Full retirement: status, manifest, then stage with upstream delete.
    pub fn retire(&self, accession: &str, mode: WriteMode) -> Result<()> {
        self.retire_with_tombstone(accession, None, mode)
    }

    /// [`Ledger::retire`], stamping `tombstone` on the manifest row before it
    /// is retired so the retired row records why.
    pub fn retire_with_tombstone(
        &self,
        accession: &str,
        tombstone: Option<&Status>,
        mode: WriteMode,
    ) -> Result<()> {
        self.retire_status_only(accession, None, mode)?;
        if let Some(status) = tombstone {
            self.set_manifest_status(accession, status, mode)?;
        }
        self.retire_manifest_only(accession, mode)?;
        self.retire_stage_only(accession, None, true, mode)?;
        Ok(())
    }

    /// Update the single active manifest row in place; insert a fresh row when
    /// none is active. `attrs` of `None` keeps the stored attributes.
    pub fn reactivate_manifest(
        &self,
        accession: &str,
        status: &Status,
        attrs: Option<&ModuleAttrs>,
        mode: WriteMode,
    ) -> Result<()> {
        if self.active_manifest(accession)?.is_none() {
            let empty = ModuleAttrs::default();
            return self.insert_manifest(accession, status, attrs.unwrap_or(&empty), mode);
        }
        let Some(attrs) = attrs else {
            return self.set_manifest_status(accession, status, mode);
        };
        let statement = Sql::new(format!(
            "UPDATE {} SET manifest_status = ?2, last_datetime_processed = ?3, subject_id = ?4, object_info = ?5
             WHERE accession_num = ?1 AND active = 1",
            self.tables.manifest
        ))
        .text(accession)
        .text(&stored(status))
        .text(&now_timestamp())
        .text(&attrs.subject_id)
        .text(&attrs.object_info_json()?);
        self.mutate(mode, &self.manifest_pre_image(accession), &statement)?;
        Ok(())
    }

    pub fn insert_manifest(
        &self,
        accession: &str,
        status: &Status,
        attrs: &ModuleAttrs,
        mode: WriteMode,
    ) -> Result<()> {
        let statement = Sql::new(format!(
            "INSERT INTO {} (accession_num, manifest_status, last_datetime_processed, active, subject_id, object_info)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            self.tables.manifest
        ))
        .text(accession)
        .text(&stored(status))
        .text(&now_timestamp())
        .text(&attrs.subject_id)
        .text(&attrs.object_info_json()?);
        self.mutate(mode, &self.manifest_pre_image(accession), &statement)?;
        Ok(())
    }

    pub fn set_manifest_status(
        &self,
        accession: &str,
        status: &Status,
        mode: WriteMode,
    ) -> Result<()> {
        let statement = Sql::new(format!(
            "UPDATE {} SET manifest_status = ?2, last_datetime_processed = ?3
             WHERE accession_num = ?1 AND active = 1",
            self.tables.manifest
        ))
        .text(accession)
        .text(&stored(status))
        .text(&now_timestamp());
        self.mutate(mode, &self.manifest_pre_image(accession), &statement)?;
        Ok(())
    }

    /// Advance `last_datetime_processed` only.
    pub fn touch_manifest(&self, accession: &str, mode: WriteMode) -> Result<()> {
        let statement = Sql::new(format!(
            "UPDATE {} SET last_datetime_processed = ?2 WHERE accession_num = ?1 AND active = 1",
            self.tables.manifest
        ))
        .text(accession)
        .text(&now_timestamp());
        self.mutate(mode, &self.manifest_pre_image(accession), &statement)?;
        Ok(())
    }

    pub fn insert_status(
        &self,
        accession: &str,
        uuid: &str,
        change_seq_id: i64,
        phase: i64,
        attrs: &ModuleAttrs,
        mode: WriteMode,
    ) -> Result<()> {
        let statement = Sql::new(format!(
            "INSERT INTO {} (accession_num, uuid, change_seq_id, phase_processed, datetime_processed,
                deidentified_targets, active, subject_id, object_info)
             VALUES (?1, ?2, ?3, ?4, ?5, '', 1, ?6, ?7)",
            self.tables.status
        ))
        .text(accession)
        .text(uuid)
        .int(change_seq_id)
        .int(phase)
        .text(&now_timestamp())
        .text(&attrs.subject_id)
        .text(&attrs.object_info_json()?);
        self.mutate(mode, &self.status_pre_image(accession), &statement)?;
        Ok(())
    }

    /// Record a completed phase (and the targets written so far) on one row.
    pub fn set_status_phase(
        &self,
        accession: &str,
        change_seq_id: i64,
        phase: i64,
        targets: &str,
        mode: WriteMode,
    ) -> Result<()> {
        let pre_image = Sql::new(format!(
            "{} AND change_seq_id = ?2",
            self.status_pre_image(accession).sql()
        ))
        .text(accession)
        .int(change_seq_id);
        let statement = Sql::new(format!(
            "UPDATE {} SET phase_processed = ?3, deidentified_targets = ?4, datetime_processed = ?5
             WHERE accession_num = ?1 AND change_seq_id = ?2 AND active = 1",
            self.tables.status
        ))
        .text(accession)
        .int(change_seq_id)
        .int(phase)
        .text(targets)
        .text(&now_timestamp());
        self.mutate(mode, &pre_image, &statement)?;
        Ok(())
    }

    /// Rewind every active status row of the accession to `phase`.
    pub fn reset_status_phases(&self, accession: &str, phase: i64, mode: WriteMode) -> Result<()> {
        let statement = Sql::new(format!(
            "UPDATE {} SET phase_processed = ?2, datetime_processed = ?3
             WHERE accession_num = ?1 AND active = 1",
            self.tables.status
        ))
        .text(accession)
        .int(phase)
        .text(&now_timestamp());
        self.mutate(mode, &self.status_pre_image(accession), &statement)?;
        Ok(())
    }
}

/// The text written to `manifest_status`; the dry-run marker never reaches the ledger.
fn stored(status: &Status) -> String {
    Status {
        dry_run: false,
        ..status.clone()
    }
    .to_string()
}
