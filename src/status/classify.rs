use super::{Status, StatusKind};
use std::fmt;

/// Summary buckets used by the `# STATUS_OUT:` tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusBucket {
    NotFound,
    AwaitingUpstream,
    Running,
    TerminalSuccess,
    Problem,
    OnDeck,
    Other,
}

/// Display order for the tally block.
pub const BUCKET_ORDER: [StatusBucket; 7] = [
    StatusBucket::NotFound,
    StatusBucket::AwaitingUpstream,
    StatusBucket::Running,
    StatusBucket::TerminalSuccess,
    StatusBucket::Problem,
    StatusBucket::OnDeck,
    StatusBucket::Other,
];

impl StatusBucket {
    /// Classify a status. The dry-run marker is transparent; on-deck wins over
    /// the wrapped kind.
    pub fn of(status: &Status) -> StatusBucket {
        if status.on_deck {
            return StatusBucket::OnDeck;
        }
        match &status.kind {
            StatusKind::NotFound => StatusBucket::NotFound,
            kind if kind.is_pending() => StatusBucket::AwaitingUpstream,
            StatusKind::ProcessingChange
            | StatusKind::ProcessingChangeMomentarily
            | StatusKind::ReprocessingChange
            | StatusKind::ReprocessingChangeMomentarily => StatusBucket::Running,
            kind if kind.is_processed() || kind.is_resolved() => StatusBucket::TerminalSuccess,
            kind if kind.is_error() => StatusBucket::Problem,
            _ => StatusBucket::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusBucket::NotFound => "NOT_FOUND",
            StatusBucket::AwaitingUpstream => "AWAITING_UPSTREAM",
            StatusBucket::Running => "RUNNING",
            StatusBucket::TerminalSuccess => "TERMINAL_SUCCESS",
            StatusBucket::Problem => "PROBLEM",
            StatusBucket::OnDeck => "ZZZ-ONDECK",
            StatusBucket::Other => "OTHER",
        }
    }
}

impl fmt::Display for StatusBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
