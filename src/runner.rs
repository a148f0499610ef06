//! The batch loop: run commands once, drive processing modules until the
//! batch converges, errors out, or the gate closes.
use crate::config::{GlobalConfig, RunMode};
use crate::errors::{classify_failure, is_invalid_credential, truncated_chain, ProcessorError};
use crate::gate::{GateCheck, GateScope};
use crate::module::{Command, ProcessingModule};
use anyhow::Result;
use std::rc::Rc;
use std::time::{Duration, Instant};

const MAX_TRACE_BYTES: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub run_mode: RunMode,
    pub converge: bool,
    pub max_iterations: u32,
    pub wait: Duration,
}

impl RunnerSettings {
    pub fn from_config(global: &GlobalConfig) -> Self {
        Self {
            run_mode: global.run_mode,
            converge: global.continue_to_manifest_convergence,
            max_iterations: global.convergence_max_iterations.max(1),
            wait: Duration::from_secs(global.continuous_wait_secs),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    SingleRun,
    Converged,
    MaxIterations,
    /// Continuous mode stops at the first iteration with errors.
    Errors,
    Fatal(String),
    GateClosed(GateScope),
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Termination::Fatal(_) | Termination::GateClosed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub iterations: u32,
    pub total_errors: u64,
    pub total_processed: u64,
    pub termination: Termination,
}

impl RunReport {
    /// Total errors, and at least 1 when the run ended on a fatal condition.
    pub fn exit_code(&self) -> i32 {
        let errors = if self.termination.is_fatal() {
            self.total_errors.max(1)
        } else {
            self.total_errors
        };
        i32::try_from(errors).unwrap_or(i32::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    errors: u64,
    processed: u64,
}

impl Counters {
    fn is_idle(&self) -> bool {
        self.errors == 0 && self.processed == 0
    }
}

/// The line logged when the loop decides the batch has converged.
pub fn convergence_line(this: (u64, u64), last: (u64, u64), lastlast: (u64, u64)) -> String {
    format!(
        "calling CONVERGENCE: errors this/last/lastlast = {}/{}/{}; processed this/last/lastlast = {}/{}/{}",
        this.0, last.0, lastlast.0, this.1, last.1, lastlast.1
    )
}

pub struct Runner {
    settings: RunnerSettings,
    modules: Vec<Box<dyn ProcessingModule>>,
    commands: Vec<Box<dyn Command>>,
    gate: Rc<dyn GateCheck>,
    sleep: Box<dyn FnMut(Duration)>,
}

impl Runner {
    pub fn new(
        settings: RunnerSettings,
        modules: Vec<Box<dyn ProcessingModule>>,
        commands: Vec<Box<dyn Command>>,
        gate: Rc<dyn GateCheck>,
    ) -> Result<Self> {
        if settings.converge && !commands.is_empty() {
            return Err(ProcessorError::Config(
                "continue_to_manifest_convergence cannot be combined with summarizer, stage_compare or qc"
                    .to_string(),
            )
            .into());
        }
        Ok(Self {
            settings,
            modules,
            commands,
            gate,
            sleep: Box::new(std::thread::sleep),
        })
    }

    /// Replace the wait between iterations.
    #[cfg(test)]
    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    fn run_commands(&mut self, this: &mut Counters) -> bool {
        let mut fatal = false;
        for command in &mut self.commands {
            let started = Instant::now();
            match command.run() {
                Ok(outcome) => {
                    this.errors += outcome.errors;
                    tracing::info!(
                        command = command.name(),
                        errors = outcome.errors,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "command finished"
                    );
                }
                Err(err) => {
                    this.errors += 1;
                    fatal |= is_invalid_credential(&err);
                    tracing::error!(
                        command = command.name(),
                        error = %truncated_chain(&err, MAX_TRACE_BYTES),
                        "command failed"
                    );
                }
            }
        }
        fatal
    }

    fn run_modules(&mut self, this: &mut Counters) -> bool {
        let mut fatal = false;
        for module in &mut self.modules {
            let started = Instant::now();
            match module.process() {
                Ok(outcome) => {
                    this.errors += outcome.errors;
                    this.processed += outcome.succeeded;
                    fatal |= outcome.fatal;
                    tracing::info!(
                        module = module.name(),
                        succeeded = outcome.succeeded,
                        errors = outcome.errors,
                        fatal = outcome.fatal,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "module pass finished"
                    );
                }
                Err(err) => {
                    this.errors += 1;
                    fatal |= classify_failure(&err).is_fatal();
                    tracing::error!(
                        module = module.name(),
                        error = %truncated_chain(&err, MAX_TRACE_BYTES),
                        "module pass failed"
                    );
                }
            }
        }
        fatal
    }

    pub fn run(mut self) -> RunReport {
        let settings = self.settings;
        let mut this = Counters::default();
        let mut last = Counters::default();
        let mut lastlast;
        let mut total = Counters::default();
        let mut iteration: u32 = 0;

        let termination = loop {
            lastlast = last;
            last = this;
            this = Counters::default();

            let mut fatal = false;
            if iteration == 0 {
                fatal |= self.run_commands(&mut this);
            }
            fatal |= self.run_modules(&mut this);
            iteration += 1;
            total.errors += this.errors;
            total.processed += this.processed;
            tracing::info!(
                iteration,
                errors = this.errors,
                processed = this.processed,
                total_errors = total.errors,
                "iteration complete"
            );

            if fatal {
                break Termination::Fatal(format!("fatal errors in iteration {iteration}"));
            }
            if !settings.converge {
                if settings.run_mode == RunMode::Single {
                    break Termination::SingleRun;
                }
                if this.errors > 0 {
                    break Termination::Errors;
                }
            } else {
                for module in &mut self.modules {
                    module.clear_preparation_flags();
                }
                let quiet = iteration >= 2 && this.is_idle() && last.is_idle();
                let steady = iteration >= 3 && this == last && last == lastlast;
                if quiet || steady {
                    tracing::info!(
                        "{}",
                        convergence_line(
                            (this.errors, this.processed),
                            (last.errors, last.processed),
                            (lastlast.errors, lastlast.processed),
                        )
                    );
                    break Termination::Converged;
                }
                if iteration >= settings.max_iterations {
                    tracing::error!(
                        "{}",
                        ProcessorError::ConvergenceDivergence(settings.max_iterations)
                    );
                    break Termination::MaxIterations;
                }
                if let Some(err) = self
                    .modules
                    .iter_mut()
                    .find_map(|module| module.setup_input_manifest(iteration).err())
                {
                    total.errors += 1;
                    break Termination::Fatal(truncated_chain(&err, MAX_TRACE_BYTES));
                }
            }

            if !settings.wait.is_zero() {
                tracing::debug!(secs = settings.wait.as_secs(), "sleeping before next iteration");
            }
            (self.sleep)(settings.wait);
            match self.gate.closed_scope() {
                Ok(None) => {}
                Ok(Some(scope)) => {
                    tracing::error!(%scope, "FATAL ERROR: system status inactive");
                    break Termination::GateClosed(scope);
                }
                Err(err) => break Termination::Fatal(truncated_chain(&err, MAX_TRACE_BYTES)),
            }
        };

        if let Termination::Fatal(reason) = &termination {
            tracing::error!(reason = reason.as_str(), "FATAL ERROR: terminating");
        }
        RunReport {
            iterations: iteration,
            total_errors: total.errors,
            total_processed: total.processed,
            termination,
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
