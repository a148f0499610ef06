//! Error taxonomy and the upstream-credential predicate.
//!
//! Flow code uses `anyhow`; these typed variants mark the failures the Runner
//! must tell apart (fatal vs. counted).
use thiserror::Error;

/// Substring the upstream store (or its proxy) reports for a rejected token.
const INVALID_JWT_SIGNATURE: &str = "invalid jwt signature";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
    #[error("processing failed for accession {accession}: {reason}")]
    ModuleProcessing { accession: String, reason: String },
    #[error("cannot resolve accession {accession} via {command}: {reason}")]
    Resolver {
        accession: String,
        command: String,
        reason: String,
    },
    #[error("system status gate inactive: {0}")]
    Gate(String),
    #[error("TERMINATING thanks to MAX iterations ({0})")]
    ConvergenceDivergence(u32),
}

/// How the Runner treats a failure surfaced by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Credentials rejected upstream; convergence must stop.
    Auth,
    /// Ledger unavailable; the iteration cannot continue.
    Ledger,
    /// Gate closed while working.
    Gate,
    /// Counted and carried on.
    Counted,
}

/// True when any error in the chain is the invalid-credential class.
pub fn is_invalid_credential(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(ProcessorError::Auth(_)) = cause.downcast_ref::<ProcessorError>() {
            return true;
        }
        message_is_invalid_credential(&cause.to_string())
    })
}

/// The single place an upstream message is inspected for the JWT signature.
pub fn message_is_invalid_credential(message: &str) -> bool {
    message.to_ascii_lowercase().contains(INVALID_JWT_SIGNATURE)
}

pub fn classify_failure(err: &anyhow::Error) -> FailureClass {
    if is_invalid_credential(err) {
        return FailureClass::Auth;
    }
    for cause in err.chain() {
        if cause.downcast_ref::<rusqlite::Error>().is_some() {
            return FailureClass::Ledger;
        }
        match cause.downcast_ref::<ProcessorError>() {
            Some(ProcessorError::Ledger(_)) => return FailureClass::Ledger,
            Some(ProcessorError::Gate(_)) => return FailureClass::Gate,
            _ => {}
        }
    }
    FailureClass::Counted
}

impl FailureClass {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FailureClass::Counted)
    }
}

/// Render an error chain on one line, truncated for log output.
pub fn truncated_chain(err: &anyhow::Error, max_bytes: usize) -> String {
    let rendered = err
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    crate::util::truncate_string(&rendered, max_bytes)
}
