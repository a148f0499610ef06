use crate::status::Status;
use anyhow::{Context, Result};
use rusqlite::Row;

/// Module-specific attributes carried on manifest and status rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAttrs {
    pub subject_id: String,
    pub object_info: Vec<String>,
}

impl ModuleAttrs {
    pub(crate) fn object_info_json(&self) -> Result<String> {
        serde_json::to_string(&self.object_info).context("encode object_info")
    }

    pub(crate) fn from_columns(subject_id: String, object_info: &str) -> Self {
        // A hand-edited row with malformed JSON keeps its raw text.
        let object_info = serde_json::from_str::<Vec<String>>(object_info)
            .unwrap_or_else(|_| vec![object_info.to_string()]);
        Self {
            subject_id,
            object_info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub id: i64,
    pub accession_num: String,
    pub manifest_status: String,
    pub last_datetime_processed: String,
    pub active: bool,
    pub attrs: ModuleAttrs,
}

impl ManifestRow {
    pub(crate) const COLUMNS: &'static str =
        "id, accession_num, manifest_status, last_datetime_processed, active, subject_id, object_info";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let object_info: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            accession_num: row.get(1)?,
            manifest_status: row.get(2)?,
            last_datetime_processed: row.get(3)?,
            active: row.get(4)?,
            attrs: ModuleAttrs::from_columns(row.get(5)?, &object_info),
        })
    }

    pub fn status(&self) -> Status {
        Status::parse(&self.manifest_status)
    }
}

/// One de-identified output variant of an accession.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRow {
    pub id: i64,
    pub accession_num: String,
    pub uuid: String,
    pub change_seq_id: i64,
    pub phase_processed: i64,
    pub datetime_processed: String,
    pub deidentified_targets: String,
    pub active: bool,
    pub attrs: ModuleAttrs,
}

impl StatusRow {
    pub(crate) const COLUMNS: &'static str = "id, accession_num, uuid, change_seq_id, phase_processed, datetime_processed, deidentified_targets, active, subject_id, object_info";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let object_info: String = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            accession_num: row.get(1)?,
            uuid: row.get(2)?,
            change_seq_id: row.get(3)?,
            phase_processed: row.get(4)?,
            datetime_processed: row.get(5)?,
            deidentified_targets: row.get(6)?,
            active: row.get(7)?,
            attrs: ModuleAttrs::from_columns(row.get(8)?, &object_info),
        })
    }

    /// The most recently recorded target (targets are `;`-separated).
    pub fn latest_target(&self) -> Option<&str> {
        self.deidentified_targets
            .rsplit(';')
            .map(str::trim)
            .find(|target| !target.is_empty())
    }
}

/// A staged upstream copy, as advertised by the stager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRow {
    pub id: i64,
    pub accession_str: String,
    pub uuid: String,
    pub change_seq_id: i64,
    pub datetime_staged: String,
    pub active: bool,
}

impl StageRow {
    pub(crate) const COLUMNS: &'static str =
        "id, accession_str, uuid, change_seq_id, datetime_staged, active";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            accession_str: row.get(1)?,
            uuid: row.get(2)?,
            change_seq_id: row.get(3)?,
            datetime_staged: row.get(4)?,
            active: row.get(5)?,
        })
    }
}
