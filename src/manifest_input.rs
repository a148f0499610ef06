//! Input manifests: CSV lists of accessions with a versioned header.
//!
//! Accepted headers are the simple one-column list, the module-specific
//! layouts, and (for the summarizer's resolver mode) the module layouts with a
//! trailing `RESOLVE_VIA` column. `#` lines are comments and are kept in order.
use crate::config::ModuleKind;
use crate::errors::ProcessorError;
use crate::ledger::ModuleAttrs;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

pub const SIMPLE_HEADER: &str = "ACCESSION_NUM";
pub const ONPREM_HEADER: &str = "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,ACCESSION_NUM";
pub const CLOUD_HEADER: &str =
    "SUBJECT_ID,OBJECT_INFO_01,OBJECT_INFO_02,OBJECT_INFO_03,OBJECT_INFO_04,OBJECT_INFO_05,ACCESSION_NUM";
pub const RESOLVE_VIA_COLUMN: &str = "RESOLVE_VIA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVersion {
    Simple,
    Module(ModuleKind),
}

impl HeaderVersion {
    fn columns(&self) -> &'static str {
        match self {
            HeaderVersion::Simple => SIMPLE_HEADER,
            HeaderVersion::Module(ModuleKind::Onprem) => ONPREM_HEADER,
            HeaderVersion::Module(ModuleKind::Cloud) => CLOUD_HEADER,
        }
    }

    fn width(&self) -> usize {
        self.columns().split(',').count()
    }
}

/// The header an input must carry for `kind` with the resolver on or off.
pub fn expected_header(kind: ModuleKind, resolver: bool) -> String {
    let columns = HeaderVersion::Module(kind).columns();
    if resolver {
        format!("{columns},{RESOLVE_VIA_COLUMN}")
    } else {
        format!("{SIMPLE_HEADER} or {columns}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub line_no: usize,
    /// Input columns as read (trimmed), excluding `RESOLVE_VIA`.
    pub columns: Vec<String>,
    pub accession: String,
    pub attrs: ModuleAttrs,
    pub resolve_via: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Comment(String),
    Row(InputRow),
}

#[derive(Debug, Clone)]
pub struct ManifestInput {
    pub name: String,
    pub version: HeaderVersion,
    pub resolver: bool,
    pub lines: Vec<InputLine>,
}

impl ManifestInput {
    pub fn header_columns(&self) -> Vec<&'static str> {
        self.version.columns().split(',').collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &InputRow> {
        self.lines.iter().filter_map(|line| match line {
            InputLine::Row(row) => Some(row),
            InputLine::Comment(_) => None,
        })
    }
}

pub fn read_manifest(path: &Path, kind: ModuleKind, resolver: bool) -> Result<ManifestInput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_manifest(&text, &name, kind, resolver)
        .with_context(|| format!("parse manifest {}", path.display()))
}

pub fn parse_manifest(
    text: &str,
    name: &str,
    kind: ModuleKind,
    resolver: bool,
) -> Result<ManifestInput> {
    let accession_pattern =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").context("compile accession pattern")?;
    let mut lines = Vec::new();
    let mut version = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = raw.trim().trim_start_matches('\u{feff}');
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            lines.push(InputLine::Comment(comment.trim().to_string()));
            continue;
        }
        let Some(layout) = version else {
            version = Some(parse_header(trimmed, kind, resolver)?);
            continue;
        };
        let mut columns: Vec<String> = trimmed.split(',').map(|c| c.trim().to_string()).collect();
        let width = layout.width() + usize::from(resolver);
        if columns.len() != width {
            return Err(config_error(format!(
                "line {line_no}: expected {width} columns, found {}",
                columns.len()
            )));
        }
        let resolve_via = if resolver {
            columns.pop().filter(|value| !value.is_empty())
        } else {
            None
        };
        let accession = columns.last().cloned().unwrap_or_default();
        if !accession_pattern.is_match(&accession) {
            return Err(config_error(format!(
                "line {line_no}: invalid accession {accession:?}"
            )));
        }
        let attrs = match layout {
            HeaderVersion::Simple => ModuleAttrs::default(),
            HeaderVersion::Module(_) => ModuleAttrs {
                subject_id: columns[0].clone(),
                object_info: columns[1..columns.len() - 1].to_vec(),
            },
        };
        lines.push(InputLine::Row(InputRow {
            line_no,
            columns,
            accession,
            attrs,
            resolve_via,
        }));
    }

    let version = version.ok_or_else(|| {
        config_error(format!(
            "{name} has no header; expected {}",
            expected_header(kind, resolver)
        ))
    })?;
    Ok(ManifestInput {
        name: name.to_string(),
        version,
        resolver,
        lines,
    })
}

fn parse_header(line: &str, kind: ModuleKind, resolver: bool) -> Result<HeaderVersion> {
    let normalized = line
        .split(',')
        .map(|column| column.trim().to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(",");
    let (columns, has_resolve_via) = match normalized.strip_suffix(&format!(",{RESOLVE_VIA_COLUMN}")) {
        Some(columns) => (columns.to_string(), true),
        None => (normalized, false),
    };
    let version = if columns == SIMPLE_HEADER {
        Some(HeaderVersion::Simple)
    } else if columns == HeaderVersion::Module(kind).columns() {
        Some(HeaderVersion::Module(kind))
    } else {
        None
    };
    match version {
        // The resolver works on module layouts only.
        Some(HeaderVersion::Simple) if has_resolve_via || resolver => {}
        Some(version) if has_resolve_via == resolver => return Ok(version),
        _ => {}
    }
    Err(config_error(format!(
        "unexpected manifest header {line:?}; expected {}",
        expected_header(kind, resolver)
    )))
}

fn config_error(message: String) -> anyhow::Error {
    ProcessorError::Config(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_list_keeps_comments_in_order() {
        let text = "ACCESSION_NUM\n# batch 7\nA1\n\nB2\n";
        let input = parse_manifest(text, "list.csv", ModuleKind::Onprem, false).expect("parse");
        assert_eq!(input.version, HeaderVersion::Simple);
        assert_eq!(input.lines.len(), 3);
        assert_eq!(input.lines[0], InputLine::Comment("batch 7".to_string()));
        let accessions: Vec<&str> = input.rows().map(|row| row.accession.as_str()).collect();
        assert_eq!(accessions, vec!["A1", "B2"]);
    }

    #[test]
    fn module_layout_fills_attributes() {
        let text = format!("{CLOUD_HEADER}\nS9,a,b,c,d,e,ACC9\n");
        let input = parse_manifest(&text, "cloud.csv", ModuleKind::Cloud, false).expect("parse");
        let row = input.rows().next().expect("one row");
        assert_eq!(row.attrs.subject_id, "S9");
        assert_eq!(row.attrs.object_info, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(row.accession, "ACC9");
    }

    #[test]
    fn resolver_header_must_match_resolver_mode() {
        let with_resolver = format!("{ONPREM_HEADER},RESOLVE_VIA\nS1,x,y,C3,RESEND_RADIOLOGY\n");
        let err = parse_manifest(&with_resolver, "r.csv", ModuleKind::Onprem, false)
            .expect_err("resolver header without resolver mode");
        assert!(err.to_string().contains(ONPREM_HEADER), "{err}");

        let input = parse_manifest(&with_resolver, "r.csv", ModuleKind::Onprem, true)
            .expect("resolver mode");
        let row = input.rows().next().expect("row");
        assert_eq!(row.resolve_via.as_deref(), Some("RESEND_RADIOLOGY"));
        assert_eq!(row.columns.len(), 4);

        let plain = format!("{ONPREM_HEADER}\nS1,x,y,C3\n");
        let err = parse_manifest(&plain, "p.csv", ModuleKind::Onprem, true)
            .expect_err("plain header in resolver mode");
        assert!(err.to_string().contains("RESOLVE_VIA"), "{err}");
    }

    #[test]
    fn header_of_the_other_module_is_rejected() {
        let text = format!("{CLOUD_HEADER}\nS,a,b,c,d,e,A1\n");
        assert!(parse_manifest(&text, "x.csv", ModuleKind::Onprem, false).is_err());
    }

    #[test]
    fn retired_looking_accessions_are_rejected() {
        let err = parse_manifest("ACCESSION_NUM\n-A1\n", "x.csv", ModuleKind::Onprem, false)
            .expect_err("leading dash");
        assert!(err.to_string().contains("line 2"), "{err}");
    }
}
