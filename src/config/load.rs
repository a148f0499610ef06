use super::{
    AuditConfig, GlobalConfig, ProcessorConfig, StagerConfig, SummarizerConfig,
};
use crate::errors::ProcessorError;
use crate::util::stream_safe;
use anyhow::{Context, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Where an effective configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Document,
    Env,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Default => "default",
            ConfigSource::Document => "config",
            ConfigSource::Env => "env",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Global,
    Onprem,
    Cloud,
    Summarizer,
    StageCompare,
    Qc,
}

/// Global keys are bare; checked first so a global key never shadows a prefix.
const SECTIONS: [(Section, &str); 6] = [
    (Section::Global, ""),
    (Section::Onprem, "onprem_"),
    (Section::Cloud, "cloud_"),
    (Section::Summarizer, "summarizer_"),
    (Section::StageCompare, "stage_compare_"),
    (Section::Qc, "qc_"),
];

fn object_of<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn section_values(config: &ProcessorConfig, section: Section) -> Map<String, Value> {
    match section {
        Section::Global => object_of(&config.global),
        Section::Onprem => object_of(&config.onprem),
        Section::Cloud => object_of(&config.cloud),
        Section::Summarizer => object_of(&config.summarizer),
        Section::StageCompare => object_of(&config.stage_compare),
        Section::Qc => object_of(&config.qc),
    }
}

/// Load the config document from disk, applying process-environment overrides.
pub fn load_config(path: &Path) -> Result<ProcessorConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    load_config_from_str(&text, |key| std::env::var(key).ok())
        .with_context(|| format!("load config {}", path.display()))
}

/// Parse a config document with an injectable environment lookup.
pub fn load_config_from_str<E>(text: &str, env: E) -> Result<ProcessorConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let document: Value = serde_json::from_str(text).context("parse config JSON")?;
    let Value::Object(document) = document else {
        return Err(config_error("config document must be a JSON object"));
    };

    let defaults = ProcessorConfig::default();
    let default_maps: Vec<Map<String, Value>> = SECTIONS
        .iter()
        .map(|(section, _)| section_values(&defaults, *section))
        .collect();
    let mut maps: Vec<Map<String, Value>> = vec![Map::new(); SECTIONS.len()];
    let mut sources = BTreeMap::new();

    for (key, value) in document {
        let (index, field) = locate_key(&key, &default_maps)
            .ok_or_else(|| config_error(&format!("unrecognised config key {key:?}")))?;
        maps[index].insert(field, value);
        sources.insert(key, ConfigSource::Document);
    }

    for (index, (_, prefix)) in SECTIONS.iter().enumerate() {
        for (field, default) in &default_maps[index] {
            let key = format!("{prefix}{field}");
            let Some(raw) = env(&key) else {
                continue;
            };
            let value = parse_env_value(&key, &raw, default)?;
            maps[index].insert(field.clone(), value);
            sources.insert(key, ConfigSource::Env);
        }
    }

    let mut maps = maps.into_iter();
    let mut next_section = || Value::Object(maps.next().unwrap_or_default());
    let config = ProcessorConfig {
        global: decode::<GlobalConfig>(next_section(), "global")?,
        onprem: decode::<StagerConfig>(next_section(), "onprem")?,
        cloud: decode::<StagerConfig>(next_section(), "cloud")?,
        summarizer: decode::<SummarizerConfig>(next_section(), "summarizer")?,
        stage_compare: decode::<AuditConfig>(next_section(), "stage_compare")?,
        qc: decode::<AuditConfig>(next_section(), "qc")?,
        sources,
    };
    validate_config(&config)?;
    Ok(config)
}

fn locate_key(key: &str, default_maps: &[Map<String, Value>]) -> Option<(usize, String)> {
    for (index, (_, prefix)) in SECTIONS.iter().enumerate() {
        let Some(field) = key.strip_prefix(prefix) else {
            continue;
        };
        if default_maps[index].contains_key(field) {
            return Some((index, field.to_string()));
        }
    }
    None
}

fn parse_env_value(key: &str, raw: &str, default: &Value) -> Result<Value> {
    match default {
        Value::Bool(_) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(config_error(&format!(
                "environment override {key} must be true or false (got {other:?})"
            ))),
        },
        Value::Number(_) => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| {
                config_error(&format!(
                    "environment override {key} must be a non-negative integer (got {raw:?})"
                ))
            }),
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn decode<T: DeserializeOwned>(value: Value, section: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| config_error(&format!("invalid {section} options: {err}")))
}

fn validate_config(config: &ProcessorConfig) -> Result<()> {
    let global = &config.global;
    if global.convergence_max_iterations == 0 {
        return Err(config_error("convergence_max_iterations must be at least 1"));
    }
    if global.continue_to_manifest_convergence && config.has_single_shot_commands() {
        return Err(config_error(
            "continue_to_manifest_convergence is mutually exclusive with summarizer_process, stage_compare_process and qc_process",
        ));
    }
    if global.workspaces_enable {
        let pattern = Regex::new(r"^[A-Za-z0-9_]+$").context("compile workspace pattern")?;
        if !pattern.is_match(&global.workspace_name) {
            return Err(config_error(&format!(
                "workspaces_enable requires an alphanumeric workspace_name (got {:?})",
                global.workspace_name
            )));
        }
    }
    if config.summarizer.preload_enable && config.summarizer.preset_enable {
        return Err(config_error(
            "summarizer_preload_enable and summarizer_preset_enable are mutually exclusive",
        ));
    }
    Ok(())
}

/// Every recognised key with its effective value rendered as text.
pub(super) fn flatten(config: &ProcessorConfig) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for (section, prefix) in SECTIONS {
        for (field, value) in section_values(config, section) {
            let rendered = match value {
                Value::String(text) => stream_safe(&text),
                other => other.to_string(),
            };
            entries.push((format!("{prefix}{field}"), rendered));
        }
    }
    entries
}

fn config_error(message: &str) -> anyhow::Error {
    ProcessorError::Config(message.to_string()).into()
}
