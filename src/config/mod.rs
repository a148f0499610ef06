//! Typed processor configuration.
//!
//! The document is a flat JSON object. Recognised keys are enumerated from the
//! typed sections below (global keys bare, per-section keys behind a prefix such
//! as `onprem_` or `summarizer_`); anything else is rejected. Every key may be
//! overridden by an environment variable of exactly the same name.
mod load;

pub use load::{load_config, ConfigSource};
#[cfg(test)]
pub use load::load_config_from_str;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_MAX_ITERATIONS: u32 = 11;
pub const DEFAULT_CONTINUOUS_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Single,
    Continuous,
}

/// Special mode that touches only the Gate and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatusMode {
    None,
    Read,
    Write,
}

/// Upstream source a processing module (or a command targeting it) serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Onprem,
    Cloud,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Onprem => "onprem",
            ModuleKind::Cloud => "cloud",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct GlobalConfig {
    pub run_mode: RunMode,
    pub continue_to_manifest_convergence: bool,
    pub continuous_wait_secs: u64,
    pub convergence_max_iterations: u32,
    pub workspaces_enable: bool,
    pub workspace_name: String,
    pub verbose: bool,
    /// `false` is dry-run: mutations are printed, never executed.
    pub enable_db_updates: bool,
    pub db_vault_path: String,
    pub node_name: String,
    pub system_status_run_mode: SystemStatusMode,
    pub system_status_type: String,
    pub system_status_node: String,
    pub system_status_desc: String,
    pub system_status_active: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Single,
            continue_to_manifest_convergence: false,
            continuous_wait_secs: DEFAULT_CONTINUOUS_WAIT_SECS,
            convergence_max_iterations: DEFAULT_MAX_ITERATIONS,
            workspaces_enable: false,
            workspace_name: String::new(),
            verbose: false,
            enable_db_updates: false,
            db_vault_path: "processor/db".to_string(),
            node_name: String::new(),
            system_status_run_mode: SystemStatusMode::None,
            system_status_type: "overall".to_string(),
            system_status_node: String::new(),
            system_status_desc: String::new(),
            system_status_active: true,
        }
    }
}

/// Options for one stager processing module (`onprem_*` / `cloud_*`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct StagerConfig {
    pub process: bool,
    pub vault_path: String,
    pub manifest_path: String,
    pub force_reprocess_accession_status: bool,
    pub predelete_accession_status: bool,
    pub preretire_accession_status: bool,
    pub use_zip_archive_structure: bool,
    pub alignment_mode: bool,
    pub force_success: bool,
    pub allow_processing_of_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SummarizerConfig {
    pub process: bool,
    pub module: ModuleKind,
    pub manifest_path: String,
    pub job_description: String,
    pub show_multiuuids: bool,
    pub resolve_multiuuids: bool,
    pub preload_enable: bool,
    pub preload_suffix: String,
    pub preset_enable: bool,
    pub preset_suffix: String,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            process: false,
            module: ModuleKind::Onprem,
            manifest_path: String::new(),
            job_description: String::new(),
            show_multiuuids: false,
            resolve_multiuuids: false,
            preload_enable: false,
            preload_suffix: "preload".to_string(),
            preset_enable: false,
            preset_suffix: "preset".to_string(),
        }
    }
}

/// Options shared by the read-only audit commands (`stage_compare_*`, `qc_*`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    pub process: bool,
    pub module: ModuleKind,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            process: false,
            module: ModuleKind::Onprem,
        }
    }
}

/// The effective configuration plus where each value came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessorConfig {
    pub global: GlobalConfig,
    pub onprem: StagerConfig,
    pub cloud: StagerConfig,
    pub summarizer: SummarizerConfig,
    pub stage_compare: AuditConfig,
    pub qc: AuditConfig,
    pub(crate) sources: BTreeMap<String, ConfigSource>,
}

impl ProcessorConfig {
    pub fn stager(&self, kind: ModuleKind) -> &StagerConfig {
        match kind {
            ModuleKind::Onprem => &self.onprem,
            ModuleKind::Cloud => &self.cloud,
        }
    }

    pub fn dry_run(&self) -> bool {
        !self.global.enable_db_updates
    }

    /// True when any single-shot command is enabled.
    pub fn has_single_shot_commands(&self) -> bool {
        self.summarizer.process || self.stage_compare.process || self.qc.process
    }

    /// Visit every recognised key with its effective value and source, in a
    /// stable order, for `CFG_OUT:` emission.
    pub fn visit<F>(&self, mut visitor: F)
    where
        F: FnMut(ConfigSource, &str, &str),
    {
        for (key, value) in load::flatten(self) {
            let source = self
                .sources
                .get(&key)
                .copied()
                .unwrap_or(ConfigSource::Default);
            visitor(source, &key, &value);
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
