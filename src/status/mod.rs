//! Controlled status vocabulary for manifest rows.
//!
//! A manifest status travels on the wire as
//! `[DRYRUN:][ZZZ-ONDECK-]KIND[:suffix]`. Internally it is a tagged value so
//! classification never depends on raw prefix matching.
mod classify;

pub use classify::{StatusBucket, BUCKET_ORDER};

use std::fmt;

/// Wire prefix marking a pseudo-status that was never written to the ledger.
pub const DRY_RUN_PREFIX: &str = "DRYRUN:";
/// Wire prefix for pre-loaded statuses; `ZZZ` sorts them after everything else.
pub const ON_DECK_PREFIX: &str = "ZZZ-ONDECK-";

/// First phase an active status row may hold.
pub const MIN_PHASE: i64 = 2;
/// Study bytes fetched from the upstream store.
pub const PHASE_DOWNLOADED: i64 = 3;
/// Study anonymized upstream.
pub const PHASE_ANONYMIZED: i64 = 4;
/// Fully processed: de-identified target written.
pub const MAX_PHASE: i64 = 5;

/// The kind of a manifest status, without on-deck/dry-run wrapping or suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    NotFound,
    PendingChange,
    PendingChangeRadiologyMerge,
    PendingChangeRadiologyResend,
    PendingChangeResolvedMultiuuids,
    ProcessingChange,
    ProcessingChangeMomentarily,
    ReprocessingChange,
    ReprocessingChangeMomentarily,
    Processed,
    /// `PREVIOUS_PROCESSING_*`; the tail is kept verbatim.
    PreviousProcessing(String),
    ResolvedMultiuuidsConsolidatedLocally,
    ResolvedMultiuuidsChosenLocally,
    ResolvedMultiuuidsDeletedLocally,
    ResolvedMultiuuidsDeletedOnStageOnly,
    /// Any other `RESOLVED_MULTIUUIDS*` spelling.
    ResolvedMultiuuidsOther(String),
    ErrorMultipleChangeUuids,
    AccessionHasMultipleSplits,
    ErrorResolvingMultiuuidCandidate,
    ErrorProcessingChange,
    /// Any other `ERROR*` code.
    Error(String),
    /// Unrecognised text; kept so a ledger written by a newer build round-trips.
    Other(String),
}

const FIXED_KINDS: [(StatusKind, &str); 19] = [
    (StatusKind::NotFound, "NOT_FOUND"),
    (
        StatusKind::PendingChangeRadiologyMerge,
        "PENDING_CHANGE_RADIOLOGY_MERGE",
    ),
    (
        StatusKind::PendingChangeRadiologyResend,
        "PENDING_CHANGE_RADIOLOGY_RESEND",
    ),
    (
        StatusKind::PendingChangeResolvedMultiuuids,
        "PENDING_CHANGE_RESOLVED_MULTIUUIDS",
    ),
    (StatusKind::PendingChange, "PENDING_CHANGE"),
    (
        StatusKind::ProcessingChangeMomentarily,
        "PROCESSING_CHANGE_MOMENTARILY",
    ),
    (StatusKind::ProcessingChange, "PROCESSING_CHANGE"),
    (
        StatusKind::ReprocessingChangeMomentarily,
        "REPROCESSING_CHANGE_MOMENTARILY",
    ),
    (StatusKind::ReprocessingChange, "REPROCESSING_CHANGE"),
    (StatusKind::Processed, "PROCESSED"),
    (
        StatusKind::ResolvedMultiuuidsConsolidatedLocally,
        "RESOLVED_MULTIUUIDS_CONSOLIDATED_LOCALLY",
    ),
    (
        StatusKind::ResolvedMultiuuidsChosenLocally,
        "RESOLVED_MULTIUUIDS_CHOSEN_LOCALLY",
    ),
    (
        StatusKind::ResolvedMultiuuidsDeletedLocally,
        "RESOLVED_MULTIUUIDS_DELETED_LOCALLY",
    ),
    (
        StatusKind::ResolvedMultiuuidsDeletedOnStageOnly,
        "RESOLVED_MULTIUUIDS_DELETED_onSTAGE_ONLY",
    ),
    (
        StatusKind::ErrorMultipleChangeUuids,
        "ERROR_MULTIPLE_CHANGE_UUIDS",
    ),
    (
        StatusKind::AccessionHasMultipleSplits,
        "ACCESSION_HAS_MULTIPLE_SPLITS",
    ),
    (
        StatusKind::ErrorResolvingMultiuuidCandidate,
        "ERROR_RESOLVING_MULTIUUID_CANDIDATE",
    ),
    (StatusKind::ErrorProcessingChange, "ERROR_PROCESSING_CHANGE"),
    (StatusKind::PreviousProcessing(String::new()), "PREVIOUS_PROCESSING"),
];

impl StatusKind {
    /// Parse a bare kind (no prefixes, no suffix). Matching is case-insensitive.
    pub fn parse(raw: &str) -> StatusKind {
        let trimmed = raw.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some(tail) = upper.strip_prefix("PREVIOUS_PROCESSING") {
            return StatusKind::PreviousProcessing(tail.trim_start_matches('_').to_string());
        }
        for (kind, text) in FIXED_KINDS.iter() {
            if matches!(kind, StatusKind::PreviousProcessing(_)) {
                continue;
            }
            if upper == text.to_ascii_uppercase() {
                return kind.clone();
            }
        }
        if upper.starts_with("RESOLVED_MULTIUUIDS") {
            return StatusKind::ResolvedMultiuuidsOther(trimmed.to_string());
        }
        if upper.starts_with("ERROR") {
            return StatusKind::Error(trimmed.to_string());
        }
        StatusKind::Other(trimmed.to_string())
    }

    /// Stable wire spelling of the kind.
    pub fn as_wire(&self) -> String {
        match self {
            StatusKind::PreviousProcessing(tail) if tail.is_empty() => {
                "PREVIOUS_PROCESSING".to_string()
            }
            StatusKind::PreviousProcessing(tail) => format!("PREVIOUS_PROCESSING_{tail}"),
            StatusKind::ResolvedMultiuuidsOther(text)
            | StatusKind::Error(text)
            | StatusKind::Other(text) => text.clone(),
            fixed => FIXED_KINDS
                .iter()
                .find(|(kind, _)| kind == fixed)
                .map(|(_, text)| text.to_string())
                .unwrap_or_default(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            StatusKind::PendingChange
                | StatusKind::PendingChangeRadiologyMerge
                | StatusKind::PendingChangeRadiologyResend
                | StatusKind::PendingChangeResolvedMultiuuids
        )
    }

    pub fn is_pending_radiology(&self) -> bool {
        matches!(
            self,
            StatusKind::PendingChangeRadiologyMerge | StatusKind::PendingChangeRadiologyResend
        )
    }

    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            StatusKind::Processed | StatusKind::PreviousProcessing(_)
        )
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, StatusKind::ErrorMultipleChangeUuids)
    }

    /// Any `%MULTIPLE%` status: several uuids or several splits.
    pub fn is_multiple_family(&self) -> bool {
        match self {
            StatusKind::ErrorMultipleChangeUuids | StatusKind::AccessionHasMultipleSplits => true,
            StatusKind::Error(text) | StatusKind::Other(text) => {
                text.to_ascii_uppercase().contains("MULTIPLE")
            }
            _ => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            StatusKind::ResolvedMultiuuidsConsolidatedLocally
                | StatusKind::ResolvedMultiuuidsChosenLocally
                | StatusKind::ResolvedMultiuuidsDeletedLocally
                | StatusKind::ResolvedMultiuuidsDeletedOnStageOnly
                | StatusKind::ResolvedMultiuuidsOther(_)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StatusKind::ErrorMultipleChangeUuids
                | StatusKind::AccessionHasMultipleSplits
                | StatusKind::ErrorResolvingMultiuuidCandidate
                | StatusKind::ErrorProcessingChange
                | StatusKind::Error(_)
        )
    }
}

/// A full manifest status value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub dry_run: bool,
    pub on_deck: bool,
    pub kind: StatusKind,
    pub suffix: Option<String>,
}

impl Status {
    pub fn new(kind: StatusKind) -> Self {
        Self {
            dry_run: false,
            on_deck: false,
            kind,
            suffix: None,
        }
    }

    pub fn with_suffix(kind: StatusKind, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self {
            suffix: (!suffix.is_empty()).then_some(suffix),
            ..Self::new(kind)
        }
    }

    pub fn on_deck(kind: StatusKind, suffix: &str) -> Self {
        Self {
            on_deck: true,
            ..Self::with_suffix(kind, suffix)
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusKind::NotFound)
    }

    /// Decode the wire form. Anything after the first `:` (past the prefixes)
    /// is suffix payload.
    pub fn parse(raw: &str) -> Self {
        let mut rest = raw.trim();
        let mut dry_run = false;
        if let Some(stripped) = strip_prefix_ignore_case(rest, DRY_RUN_PREFIX) {
            dry_run = true;
            rest = stripped;
        }
        let mut on_deck = false;
        if let Some(stripped) = strip_prefix_ignore_case(rest, ON_DECK_PREFIX) {
            on_deck = true;
            rest = stripped;
        }
        let (kind_text, suffix) = match rest.split_once(':') {
            Some((kind, suffix)) => (kind, Some(suffix.to_string())),
            None => (rest, None),
        };
        Self {
            dry_run,
            on_deck,
            kind: StatusKind::parse(kind_text),
            suffix,
        }
    }

    /// The same status with the dry-run marker applied when `dry_run` holds.
    pub fn advertised(&self, dry_run: bool) -> Self {
        Self {
            dry_run: self.dry_run || dry_run,
            ..self.clone()
        }
    }

    /// Replace the kind while keeping the on-deck wrapper and suffix.
    pub fn with_kind_preserving_context(&self, kind: StatusKind) -> Self {
        Self {
            dry_run: false,
            on_deck: self.on_deck,
            kind,
            suffix: self.suffix.clone(),
        }
    }

    pub fn is_processed(&self) -> bool {
        !self.on_deck && self.kind.is_processed()
    }

    pub fn is_pending(&self) -> bool {
        !self.on_deck && self.kind.is_pending()
    }

    pub fn is_multiple(&self) -> bool {
        self.kind.is_multiple()
    }

    pub fn is_multiple_family(&self) -> bool {
        self.kind.is_multiple_family()
    }

    pub fn is_on_deck(&self) -> bool {
        self.on_deck
    }

    pub fn is_momentarily(&self) -> bool {
        matches!(
            self.kind,
            StatusKind::ProcessingChangeMomentarily | StatusKind::ReprocessingChangeMomentarily
        )
    }

    pub fn bucket(&self) -> StatusBucket {
        StatusBucket::of(self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            f.write_str(DRY_RUN_PREFIX)?;
        }
        if self.on_deck {
            f.write_str(ON_DECK_PREFIX)?;
        }
        f.write_str(&self.kind.as_wire())?;
        if let Some(suffix) = &self.suffix {
            write!(f, ":{suffix}")?;
        }
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
