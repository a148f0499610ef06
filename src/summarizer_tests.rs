use super::*;
use crate::config::ModuleKind;
use crate::ledger::WriteMode;
use crate::status::{MAX_PHASE, MIN_PHASE};
use crate::streams::{MANIFEST_OUTPUT, ORTHANC_OUT};
use crate::testing::{FakeUpstream, FixedGate, Fixture};
use std::io::Write;
use std::rc::Rc;

fn manifest_file(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("manifest file");
    for line in lines {
        writeln!(file, "{line}").expect("write line");
    }
    file
}

fn run(fx: &Fixture, config: SummarizerConfig, mode: WriteMode) -> Result<CommandOutcome> {
    run_forcing(fx, config, false, mode)
}

fn run_forcing(
    fx: &Fixture,
    config: SummarizerConfig,
    force_reprocess: bool,
    mode: WriteMode,
) -> Result<CommandOutcome> {
    let mut summarizer = Summarizer::new(config, force_reprocess);
    summarizer.setup(fx.context(Rc::new(FixedGate::default()), mode))?;
    summarizer.run()
}

fn config_for(file: &tempfile::NamedTempFile) -> SummarizerConfig {
    SummarizerConfig {
        process: true,
        module: ModuleKind::Onprem,
        manifest_path: file.path().display().to_string(),
        job_description: "weekly, batch".to_string(),
        ..SummarizerConfig::default()
    }
}

fn output(fx: &Fixture) -> Vec<String> {
    fx.streams.lines_of(MANIFEST_OUTPUT)
}

fn tally_line(fx: &Fixture, label: &str) -> Option<String> {
    let prefix = format!("{MANIFEST_OUTPUT},# STATUS_OUT: {label},");
    output(fx)
        .into_iter()
        .find_map(|line| line.strip_prefix(&prefix).map(str::to_string))
}

#[test]
fn preload_puts_a_new_accession_on_deck() {
    let fx = Fixture::new();
    let file = manifest_file(&["ACCESSION_NUM", "A1"]);
    let config = SummarizerConfig {
        preload_enable: true,
        ..config_for(&file)
    };

    let outcome = run(&fx, config, WriteMode::Apply).expect("run");

    assert_eq!(outcome.errors, 0);
    let row = fx.manifest("A1").expect("manifest");
    assert_eq!(row.manifest_status, "ZZZ-ONDECK-PENDING_CHANGE:preload");
    assert!(fx.status_rows("A1").is_empty());
    assert_eq!(tally_line(&fx, "ZZZ-ONDECK").as_deref(), Some("1"));
    assert_eq!(tally_line(&fx, "NOT_FOUND").as_deref(), Some("0"));
    assert!(output(&fx)
        .iter()
        .any(|line| line.starts_with("MANIFEST_OUTPUT:,A1,,ZZZ-ONDECK-PENDING_CHANGE:preload,")));
}

#[test]
fn repeated_accessions_are_flagged_once_and_left_alone() {
    let fx = Fixture::new();
    let file = manifest_file(&["ACCESSION_NUM", "B2", "B2"]);

    let outcome = run(&fx, config_for(&file), WriteMode::Apply).expect("run");

    assert_eq!(outcome.errors, 0);
    let rows: Vec<String> = output(&fx)
        .into_iter()
        .filter(|line| line.starts_with("MANIFEST_OUTPUT:,B2,"))
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], "MANIFEST_OUTPUT:,B2,,NOT_FOUND,,");
    assert_eq!(rows[1], "MANIFEST_OUTPUT:,B2,WARNING:duplicates,NOT_FOUND,,");
    assert_eq!(tally_line(&fx, "DUPLICATES").as_deref(), Some("1"));
    assert_eq!(tally_line(&fx, "NOT_FOUND").as_deref(), Some("1"));
    assert_eq!(tally_line(&fx, "ROWS").as_deref(), Some("2"));
    assert_eq!(fx.row_count("onprem_manifest"), 0);
    assert!(fx.streams.lines_of(crate::streams::SQL_OUT).is_empty());
}

#[test]
fn header_block_and_comments_pass_through() {
    let fx = Fixture::new();
    fx.seed_manifest("C1", "PROCESSED");
    let file = manifest_file(&[
        "# requested by radiology",
        "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM",
        "S1,CT,HEAD,C1",
        "# trailing note",
    ]);

    run(&fx, config_for(&file), WriteMode::Apply).expect("run");

    let lines = output(&fx);
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# JOB_DESCRIPTION: weekly  batch".to_string()));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# MANIFEST_TABLE: onprem_manifest".to_string()));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# DISTINCT_ACCESSIONS: 1".to_string()));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# FLAG: enable_db_updates=true".to_string()));
    assert!(lines.contains(
        &"MANIFEST_OUTPUT:,SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM,DUPLICATE,STATUS,LAST_PROCESSED,LATEST_TARGET"
            .to_string()
    ));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# requested by radiology".to_string()));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# trailing note".to_string()));
    assert!(lines.contains(
        &"MANIFEST_OUTPUT:,S1,CT,HEAD,C1,,PROCESSED,2024-01-01 00:00:00,".to_string()
    ));
    assert_eq!(tally_line(&fx, "TERMINAL_SUCCESS").as_deref(), Some("1"));
    assert_eq!(tally_line(&fx, "LEDGER").as_deref(), Some("PROCESSED,1"));
}

#[test]
fn resolver_header_requires_resolver_mode() {
    let fx = Fixture::new();
    let file = manifest_file(&[
        "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM,RESOLVE_VIA",
        "S1,CT,HEAD,D1,RESEND_RADIOLOGY",
    ]);
    let err = run(&fx, config_for(&file), WriteMode::Apply).expect_err("header rejected");
    assert!(format!("{err:#}").contains("ACCESSION_NUM"));
}

#[test]
fn resolver_rows_are_resolved_and_failures_counted() {
    let fx = Fixture::new();
    for accession in ["D4", "D5"] {
        fx.seed_manifest(accession, "ERROR_MULTIPLE_CHANGE_UUIDS");
    }
    fx.seed_status("D4", "u5", 5, MAX_PHASE);
    fx.seed_status("D4", "u7", 7, MAX_PHASE);
    fx.seed_status("D5", "u1", 5, MAX_PHASE);
    fx.seed_status("D5", "u2", 7, 2);
    let file = manifest_file(&[
        "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM,RESOLVE_VIA",
        "S4,CT,HEAD,D4,CONSOLIDATE_LOCALLY",
        "S5,CT,HEAD,D5,CONSOLIDATE_LOCALLY",
    ]);
    let config = SummarizerConfig {
        resolve_multiuuids: true,
        ..config_for(&file)
    };

    let outcome = run(&fx, config, WriteMode::Apply).expect("run");

    assert_eq!(outcome.errors, 1);
    assert_eq!(
        fx.manifest("D4").expect("D4").manifest_status,
        "RESOLVED_MULTIUUIDS_CONSOLIDATED_LOCALLY"
    );
    assert!(output(&fx).iter().any(|line| line.starts_with(
        "MANIFEST_OUTPUT:,S5,CT,HEAD,D5,CONSOLIDATE_LOCALLY,,ERROR_RESOLVING_MULTIUUID_CANDIDATE:CONSOLIDATE_LOCALLY,"
    )));
    assert_eq!(
        tally_line(&fx, "RESOLVER").as_deref(),
        Some("errors_resolving_viaCONSOLIDATE,1")
    );
}

#[test]
fn multiuuid_rows_expand_with_study_details() {
    let upstream = FakeUpstream::default().with_study("u1", "CT");
    let fx = Fixture::with_upstream(upstream);
    fx.seed_manifest("E1", "ERROR_MULTIPLE_CHANGE_UUIDS");
    fx.seed_status("E1", "u1", 1, MAX_PHASE);
    fx.seed_status("E1", "u2", 2, MAX_PHASE);
    let file = manifest_file(&["ACCESSION_NUM", "E1"]);
    let config = SummarizerConfig {
        show_multiuuids: true,
        ..config_for(&file)
    };

    run(&fx, config, WriteMode::Apply).expect("run");

    let lines = output(&fx);
    let expanded: Vec<&String> = lines
        .iter()
        .filter(|line| line.starts_with("MANIFEST_OUTPUT:,# E1,uuid="))
        .collect();
    assert_eq!(expanded.len(), 2);
    assert!(expanded[0].contains("modality=CT"));
    assert!(expanded[0].contains("description=HEAD  W/O"));
    assert!(expanded[0].contains("instance_number=1"));
    assert!(expanded[1].contains("unavailable"));
    assert!(lines.contains(&"MANIFEST_OUTPUT:,# ----".to_string()));
    assert_eq!(fx.streams.lines_of(ORTHANC_OUT).len(), 2);
}

#[test]
fn dry_run_preset_is_advertised_and_not_written() {
    let fx = Fixture::new();
    fx.seed_manifest("F1", "PROCESSED");
    fx.seed_status("F1", "u1", 1, MAX_PHASE);
    let file = manifest_file(&["ACCESSION_NUM", "F1"]);
    let config = SummarizerConfig {
        preset_enable: true,
        ..config_for(&file)
    };

    run(&fx, config, WriteMode::DryRun).expect("run");

    assert_eq!(fx.manifest("F1").expect("F1").manifest_status, "PROCESSED");
    assert_eq!(fx.status_rows("F1")[0].phase_processed, MAX_PHASE);
    assert!(output(&fx).iter().any(|line| line
        .starts_with("MANIFEST_OUTPUT:,F1,,DRYRUN:REPROCESSING_CHANGE_MOMENTARILY:preset,")));
    assert_eq!(tally_line(&fx, "RUNNING").as_deref(), Some("1"));
}

#[test]
fn preload_and_preset_are_mutually_exclusive() {
    let fx = Fixture::new();
    let file = manifest_file(&["ACCESSION_NUM", "G1"]);
    let config = SummarizerConfig {
        preload_enable: true,
        preset_enable: true,
        ..config_for(&file)
    };
    let err = run(&fx, config, WriteMode::Apply).expect_err("exclusive");
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn forced_preload_puts_a_processed_accession_back_on_deck() {
    let fx = Fixture::new();
    fx.seed_manifest("H1", "PROCESSED");
    fx.seed_status("H1", "u1", 1, MAX_PHASE);
    let file = manifest_file(&["ACCESSION_NUM", "H1"]);
    let config = SummarizerConfig {
        preload_enable: true,
        ..config_for(&file)
    };

    let outcome = run_forcing(&fx, config, true, WriteMode::Apply).expect("run");

    assert_eq!(outcome.errors, 0);
    assert_eq!(
        fx.manifest("H1").expect("manifest").manifest_status,
        "ZZZ-ONDECK-REPROCESSING_CHANGE:preload"
    );
    let rows = fx.status_rows("H1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].phase_processed, MIN_PHASE);
    assert!(output(&fx)
        .contains(&"MANIFEST_OUTPUT:,# FLAG: force_reprocess_accession_status=true".to_string()));
}

#[test]
fn failed_resolution_does_not_stop_later_rows() {
    let fx = Fixture::new();
    fx.seed_manifest("C3", "ERROR_MULTIPLE_CHANGE_UUIDS");
    for (uuid, seq) in [("u1", 1), ("u2", 2)] {
        fx.seed_status("C3", uuid, seq, MAX_PHASE);
        fx.seed_stage("C3", uuid, seq);
    }
    fx.seed_manifest("E5", "PROCESSED");
    *fx.upstream.failure.borrow_mut() = Some("HTTP 500".to_string());
    let file = manifest_file(&[
        "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM,RESOLVE_VIA",
        "S3,CT,HEAD,C3,RESEND_RADIOLOGY",
        "S5,CT,HEAD,E5,",
    ]);
    let config = SummarizerConfig {
        resolve_multiuuids: true,
        ..config_for(&file)
    };

    let outcome = run(&fx, config, WriteMode::Apply).expect("run");

    assert_eq!(outcome.errors, 1);
    assert_eq!(
        fx.manifest("C3").expect("C3").manifest_status,
        "PENDING_CHANGE_RADIOLOGY_RESEND"
    );
    let lines = output(&fx);
    assert!(lines.iter().any(|line| line.starts_with(
        "MANIFEST_OUTPUT:,S3,CT,HEAD,C3,RESEND_RADIOLOGY,,ERROR_RESOLVING_MULTIUUID_CANDIDATE:RESEND_RADIOLOGY,"
    )));
    assert!(lines
        .iter()
        .any(|line| line.starts_with("MANIFEST_OUTPUT:,S5,CT,HEAD,E5,,,PROCESSED,")));
    assert_eq!(tally_line(&fx, "ROWS").as_deref(), Some("2"));
    assert_eq!(
        tally_line(&fx, "RESOLVER").as_deref(),
        Some("errors_resolving_viaRADIOLOGY_RESEND,1")
    );
}
