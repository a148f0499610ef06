use super::*;

#[test]
fn parses_on_deck_status_with_suffix() {
    let status = Status::parse("ZZZ-ONDECK-PENDING_CHANGE:preload");
    assert!(status.on_deck);
    assert!(!status.dry_run);
    assert_eq!(status.kind, StatusKind::PendingChange);
    assert_eq!(status.suffix.as_deref(), Some("preload"));
    assert_eq!(status.to_string(), "ZZZ-ONDECK-PENDING_CHANGE:preload");
    assert_eq!(status.bucket(), StatusBucket::OnDeck);
}

#[test]
fn classification_is_case_insensitive_and_ignores_suffix() {
    let status = Status::parse("processed:batch-7:extra");
    assert_eq!(status.kind, StatusKind::Processed);
    assert_eq!(status.suffix.as_deref(), Some("batch-7:extra"));
    assert!(status.is_processed());
    assert_eq!(status.bucket(), StatusBucket::TerminalSuccess);
}

#[test]
fn longest_pending_kind_wins_over_shorter_prefix() {
    assert_eq!(
        Status::parse("PENDING_CHANGE_RADIOLOGY_RESEND").kind,
        StatusKind::PendingChangeRadiologyResend
    );
    assert_eq!(
        Status::parse("PENDING_CHANGE").kind,
        StatusKind::PendingChange
    );
    assert_eq!(
        Status::parse("PROCESSING_CHANGE_MOMENTARILY:x").bucket(),
        StatusBucket::Running
    );
}

#[test]
fn dry_run_marker_is_transparent_to_classification() {
    let status = Status::parse("DRYRUN:RESOLVED_MULTIUUIDS_CONSOLIDATED_LOCALLY");
    assert!(status.dry_run);
    assert_eq!(
        status.kind,
        StatusKind::ResolvedMultiuuidsConsolidatedLocally
    );
    assert_eq!(status.bucket(), StatusBucket::TerminalSuccess);
    assert_eq!(
        status.to_string(),
        "DRYRUN:RESOLVED_MULTIUUIDS_CONSOLIDATED_LOCALLY"
    );
}

#[test]
fn unknown_error_codes_are_problems_and_round_trip() {
    let status = Status::parse("ERROR_UPLOADING:timeout");
    assert_eq!(status.kind, StatusKind::Error("ERROR_UPLOADING".to_string()));
    assert_eq!(status.bucket(), StatusBucket::Problem);
    assert_eq!(status.to_string(), "ERROR_UPLOADING:timeout");

    let multiple = Status::parse("ERROR_MULTIPLE_CHANGE_UUIDS");
    assert!(multiple.is_multiple());
    assert_eq!(multiple.bucket(), StatusBucket::Problem);
}

#[test]
fn multiple_family_covers_splits_and_unknown_multiple_codes() {
    let splits = Status::parse("ACCESSION_HAS_MULTIPLE_SPLITS");
    assert!(splits.is_multiple_family());
    assert!(!splits.is_multiple());
    assert!(Status::parse("ZZZ-ONDECK-ERROR_MULTIPLE_CHANGE_UUIDS:b7").is_multiple_family());
    assert!(Status::parse("ERROR_MULTIPLE_SERIES").is_multiple_family());
    assert!(!Status::parse("ERROR_RESOLVING_MULTIUUID_CANDIDATE:CHOOSE").is_multiple_family());
    assert!(!Status::parse("PROCESSED").is_multiple_family());
}

#[test]
fn previous_processing_keeps_its_tail() {
    let status = Status::parse("PREVIOUS_PROCESSING_USED_PRIOR_UUID");
    assert!(status.is_processed());
    assert_eq!(status.to_string(), "PREVIOUS_PROCESSING_USED_PRIOR_UUID");
}

#[test]
fn deleted_on_stage_only_keeps_mixed_case_spelling() {
    let status = Status::new(StatusKind::ResolvedMultiuuidsDeletedOnStageOnly);
    assert_eq!(status.to_string(), "RESOLVED_MULTIUUIDS_DELETED_onSTAGE_ONLY");
    assert_eq!(Status::parse(&status.to_string()), status);
}

#[test]
fn preserving_context_keeps_on_deck_and_suffix() {
    let existing = Status::parse("ZZZ-ONDECK-ERROR_MULTIPLE_CHANGE_UUIDS:batch9");
    let terminal =
        existing.with_kind_preserving_context(StatusKind::PendingChangeRadiologyMerge);
    assert_eq!(
        terminal.to_string(),
        "ZZZ-ONDECK-PENDING_CHANGE_RADIOLOGY_MERGE:batch9"
    );
    assert_eq!(
        terminal.advertised(true).to_string(),
        "DRYRUN:ZZZ-ONDECK-PENDING_CHANGE_RADIOLOGY_MERGE:batch9"
    );
}

#[test]
fn empty_suffix_is_dropped() {
    let status = Status::on_deck(StatusKind::PendingChange, "");
    assert_eq!(status.to_string(), "ZZZ-ONDECK-PENDING_CHANGE");
}
