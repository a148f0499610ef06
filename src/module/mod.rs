//! The boundary between the Runner and the work it drives.
//!
//! Processing modules are called every iteration; single-shot commands run
//! once, on the first iteration. The Runner sees only the outcome values
//! below.
mod pipeline;
mod stager;

pub use pipeline::{DeidPipeline, OrthancPipeline, PhaseJob};
pub use stager::StagerModule;

use crate::config::ModuleKind;
use crate::gate::GateCheck;
use crate::ledger::{Ledger, WriteMode};
use crate::streams::Streams;
use anyhow::Result;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Result of one `process` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub fatal: bool,
    pub errors: u64,
    pub succeeded: u64,
}

/// Result of a single-shot command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub errors: u64,
}

/// Everything a module or command needs from the process, built at boot.
#[derive(Clone)]
pub struct ModuleContext {
    pub kind: ModuleKind,
    pub ledger: Rc<Ledger>,
    pub gate: Rc<dyn GateCheck>,
    pub streams: Streams,
    pub mode: WriteMode,
    /// Secrets read from the module's vault path.
    pub secrets: BTreeMap<String, String>,
    /// Empty when workspaces are disabled.
    pub workspace_name: String,
}

pub trait ProcessingModule {
    fn name(&self) -> &str;
    /// Validate options, bind clients, and open the input manifest.
    fn setup(&mut self, ctx: ModuleContext) -> Result<()>;
    fn process(&mut self) -> Result<ProcessOutcome>;
    /// Re-read the input manifest before another convergence iteration.
    fn setup_input_manifest(&mut self, iteration: u32) -> Result<()>;
    /// Turn off force-reprocess / predelete / preretire for later iterations.
    fn clear_preparation_flags(&mut self);
}

pub trait Command {
    fn name(&self) -> &str;
    fn setup(&mut self, ctx: ModuleContext) -> Result<()>;
    fn run(&mut self) -> Result<CommandOutcome>;
}
