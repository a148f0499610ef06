//! Shared fixtures for unit tests: an in-memory ledger and a recording upstream.
use crate::config::ModuleKind;
use crate::gate::{GateCheck, GateScope};
use crate::ledger::{Database, Ledger, ManifestRow, StatusRow, TableNames, WriteMode};
use crate::module::ModuleContext;
use crate::streams::Streams;
use crate::upstream::{StudySummary, UpstreamStore};
use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

#[derive(Default)]
pub struct FakeUpstream {
    pub studies: RefCell<BTreeMap<String, StudySummary>>,
    pub deleted: RefCell<Vec<String>>,
    pub anonymized: RefCell<Vec<String>>,
    /// When set, every call fails with this message.
    pub failure: RefCell<Option<String>>,
}

impl FakeUpstream {
    pub fn with_study(self, uuid: &str, modality: &str) -> Self {
        self.studies.borrow_mut().insert(
            uuid.to_string(),
            StudySummary {
                uuid: uuid.to_string(),
                study_date: "20240105".to_string(),
                institution: "General".to_string(),
                series_count: 1,
                instance_count: 1,
                modality: modality.to_string(),
                manufacturer: "ACME".to_string(),
                description: "HEAD, W/O".to_string(),
                acquisition_number: Some("1".to_string()),
                instance_number: Some("1".to_string()),
            },
        );
        self
    }

    fn check(&self) -> Result<()> {
        match &*self.failure.borrow() {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

impl UpstreamStore for FakeUpstream {
    fn describe_study(&self, uuid: &str) -> Result<StudySummary> {
        self.check()?;
        self.studies
            .borrow()
            .get(uuid)
            .cloned()
            .ok_or_else(|| anyhow!("GET studies/{uuid} failed with HTTP 404"))
    }

    fn delete_study(&self, uuid: &str) -> Result<()> {
        self.check()?;
        self.deleted.borrow_mut().push(uuid.to_string());
        Ok(())
    }

    fn anonymize_study(&self, uuid: &str, subject_id: &str) -> Result<String> {
        self.check()?;
        self.anonymized.borrow_mut().push(uuid.to_string());
        Ok(format!("anon-{uuid}-{subject_id}"))
    }

    fn download_archive(&self, uuid: &str, dest: &Path) -> Result<u64> {
        self.check()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, uuid.as_bytes())?;
        Ok(uuid.len() as u64)
    }

    fn inspect_command(&self, uuid: &str) -> String {
        format!("curl -s -X GET 'http://orthanc.test/studies/{uuid}'")
    }

    fn delete_command(&self, uuid: &str) -> String {
        format!("curl -s -X DELETE 'http://orthanc.test/studies/{uuid}'")
    }
}

/// A gate whose answer is set by the test.
#[derive(Default)]
pub struct FixedGate {
    pub closed: RefCell<Option<GateScope>>,
}

impl FixedGate {
    pub fn close(&self, scope: GateScope) {
        *self.closed.borrow_mut() = Some(scope);
    }
}

impl GateCheck for FixedGate {
    fn closed_scope(&self) -> Result<Option<GateScope>> {
        Ok(self.closed.borrow().clone())
    }
}

/// An on-prem ledger over in-memory SQLite with an attached in-memory stage.
pub struct Fixture {
    pub db: Rc<Database>,
    pub ledger: Rc<Ledger>,
    pub upstream: Rc<FakeUpstream>,
    pub streams: Streams,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_upstream(FakeUpstream::default())
    }

    pub fn with_upstream(upstream: FakeUpstream) -> Self {
        let db = Rc::new(Database::open_in_memory().expect("open db"));
        db.attach_stage(ModuleKind::Onprem, ":memory:")
            .expect("attach stage");
        let upstream = Rc::new(upstream);
        let streams = Streams::capture();
        let ledger = Ledger::open(
            db.clone(),
            TableNames::for_module(ModuleKind::Onprem, None),
            streams.clone(),
            upstream.clone(),
        )
        .expect("open ledger");
        Self {
            db,
            ledger: Rc::new(ledger),
            upstream,
            streams,
        }
    }

    pub fn context(&self, gate: Rc<FixedGate>, mode: WriteMode) -> ModuleContext {
        ModuleContext {
            kind: ModuleKind::Onprem,
            ledger: self.ledger.clone(),
            gate,
            streams: self.streams.clone(),
            mode,
            secrets: BTreeMap::new(),
            workspace_name: String::new(),
        }
    }

    pub fn seed_manifest(&self, accession: &str, status: &str) {
        self.db
            .conn()
            .execute(
                &format!(
                    "INSERT INTO {} (accession_num, manifest_status, last_datetime_processed, active)
                     VALUES (?1, ?2, '2024-01-01 00:00:00', 1)",
                    self.ledger.tables().manifest
                ),
                [accession, status],
            )
            .expect("seed manifest");
    }

    pub fn seed_status(&self, accession: &str, uuid: &str, change_seq: i64, phase: i64) {
        self.db
            .conn()
            .execute(
                &format!(
                    "INSERT INTO {} (accession_num, uuid, change_seq_id, phase_processed, datetime_processed, active)
                     VALUES (?1, ?2, ?3, ?4, '2024-01-01 00:00:00', 1)",
                    self.ledger.tables().status
                ),
                rusqlite::params![accession, uuid, change_seq, phase],
            )
            .expect("seed status");
    }

    pub fn seed_stage(&self, accession: &str, uuid: &str, change_seq: i64) {
        self.db
            .conn()
            .execute(
                &format!(
                    "INSERT INTO {} (accession_str, uuid, change_seq_id, datetime_staged, active)
                     VALUES (?1, ?2, ?3, '2024-01-01 00:00:00', 1)",
                    self.ledger.tables().stage_studies
                ),
                rusqlite::params![accession, uuid, change_seq],
            )
            .expect("seed stage");
    }

    pub fn manifest(&self, accession: &str) -> Option<ManifestRow> {
        self.ledger.active_manifest(accession).expect("read manifest")
    }

    pub fn status_rows(&self, accession: &str) -> Vec<StatusRow> {
        self.ledger
            .active_status_rows(accession)
            .expect("read status rows")
    }

    /// `(accession_str, change_seq_id, active)` for every stage row.
    pub fn stage_rows(&self) -> Vec<(String, i64, bool)> {
        let mut stmt = self
            .db
            .conn()
            .prepare(&format!(
                "SELECT accession_str, change_seq_id, active FROM {} ORDER BY id",
                self.ledger.tables().stage_studies
            ))
            .expect("prepare stage read");
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .expect("query stage")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("collect stage")
    }

    /// Row count of a ledger table, active or not.
    pub fn row_count(&self, table: &str) -> i64 {
        self.db
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count rows")
    }
}
