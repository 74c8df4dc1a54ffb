//! Coverage records, merging, and report formats.
//!
//! Per-tranche coverage travels as an LCOV-subset text artifact. The
//! merged record stores hit-counts in `BTreeMap`s so merging is
//! order-independent and every rendered output is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};

/// Line and branch hit-counts for a single source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCoverage {
    /// line number -> execution count
    pub lines: BTreeMap<u32, u64>,

    /// (line, block id, branch id) -> taken count
    pub branches: BTreeMap<(u32, u32, u32), u64>,
}

/// A coverage record over any number of source files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoverageRecord {
    /// source path -> per-file coverage
    pub files: BTreeMap<String, FileCoverage>,
}

impl CoverageRecord {
    /// Whether the record covers no files at all.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Fold `other` into `self`, summing hit-counts per key.
    pub fn absorb(&mut self, other: CoverageRecord) {
        for (path, file) in other.files {
            let entry = self.files.entry(path).or_default();
            for (line, count) in file.lines {
                *entry.lines.entry(line).or_insert(0) += count;
            }
            for (branch, taken) in file.branches {
                *entry.branches.entry(branch).or_insert(0) += taken;
            }
        }
    }

    /// Parse an LCOV-subset document.
    ///
    /// Recognized directives: `SF:`, `DA:<line>,<count>`,
    /// `BRDA:<line>,<block>,<branch>,<taken>` (with `-` meaning never
    /// evaluated), `end_of_record`. Counter directives (`LF:`, `LH:`,
    /// `TN:` etc.) are ignored; counts are recomputed from the data.
    pub fn parse_lcov(input: &str) -> Result<Self> {
        let mut record = CoverageRecord::default();
        let mut current: Option<String> = None;

        for (lineno, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(path) = line.strip_prefix("SF:") {
                if path.is_empty() {
                    return Err(malformed(lineno, "empty SF path"));
                }
                record.files.entry(path.to_string()).or_default();
                current = Some(path.to_string());
            } else if let Some(rest) = line.strip_prefix("DA:") {
                let file = current_file(&mut record, &current, lineno)?;
                let mut parts = rest.splitn(2, ',');
                let line_no = parse_u32(parts.next(), lineno)?;
                let count = parse_u64(parts.next(), lineno)?;
                *file.lines.entry(line_no).or_insert(0) += count;
            } else if let Some(rest) = line.strip_prefix("BRDA:") {
                let file = current_file(&mut record, &current, lineno)?;
                let parts: Vec<&str> = rest.split(',').collect();
                if parts.len() != 4 {
                    return Err(malformed(lineno, "BRDA expects 4 fields"));
                }
                let line_no = parse_u32(Some(parts[0]), lineno)?;
                let block_id = parse_u32(Some(parts[1]), lineno)?;
                let branch_id = parse_u32(Some(parts[2]), lineno)?;
                // "-" means the branch expression was never evaluated.
                let taken = if parts[3] == "-" {
                    0
                } else {
                    parse_u64(Some(parts[3]), lineno)?
                };
                *file
                    .branches
                    .entry((line_no, block_id, branch_id))
                    .or_insert(0) += taken;
            } else if line == "end_of_record" {
                current = None;
            }
            // Unrecognized directives (TN:, LF:, LH:, FN:, ...) are skipped.
        }

        Ok(record)
    }

    /// Render as an LCOV-subset document.
    pub fn to_lcov(&self) -> String {
        let mut out = String::new();
        for (path, file) in &self.files {
            out.push_str("SF:");
            out.push_str(path);
            out.push('\n');
            for (line, count) in &file.lines {
                out.push_str(&format!("DA:{line},{count}\n"));
            }
            for ((line, block, branch), taken) in &file.branches {
                out.push_str(&format!("BRDA:{line},{block},{branch},{taken}\n"));
            }
            out.push_str("end_of_record\n");
        }
        out
    }

    /// Render as a Cobertura-style XML export for downstream tooling.
    pub fn to_xml(&self) -> String {
        let summary = CoverageSummary::of(self);
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<coverage line-rate=\"{:.4}\" lines-covered=\"{}\" lines-valid=\"{}\">\n",
            summary.percent / 100.0,
            summary.covered_lines,
            summary.total_lines
        ));
        out.push_str("  <packages><package name=\"all\"><classes>\n");
        for (path, file) in &self.files {
            out.push_str(&format!(
                "    <class filename=\"{}\"><lines>\n",
                xml_escape(path)
            ));
            for (line, count) in &file.lines {
                out.push_str(&format!(
                    "      <line number=\"{line}\" hits=\"{count}\"/>\n"
                ));
            }
            out.push_str("    </lines></class>\n");
        }
        out.push_str("  </classes></package></packages>\n");
        out.push_str("</coverage>\n");
        out
    }
}

fn current_file<'a>(
    record: &'a mut CoverageRecord,
    current: &Option<String>,
    lineno: usize,
) -> Result<&'a mut FileCoverage> {
    let path = current
        .as_ref()
        .ok_or_else(|| malformed(lineno, "data directive before SF"))?;
    Ok(record.files.get_mut(path).expect("SF inserted on open"))
}

fn parse_u32(field: Option<&str>, lineno: usize) -> Result<u32> {
    field
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| malformed(lineno, "expected integer field"))
}

fn parse_u64(field: Option<&str>, lineno: usize) -> Result<u64> {
    field
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| malformed(lineno, "expected integer field"))
}

fn malformed(lineno: usize, what: &str) -> CiError {
    CiError::Aggregation(format!("malformed lcov at line {}: {what}", lineno + 1))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('"', "&quot;")
}

/// Merge any number of records into one. Hit-counts are summed per key,
/// so the result is independent of argument order.
pub fn merge(records: impl IntoIterator<Item = CoverageRecord>) -> CoverageRecord {
    let mut merged = CoverageRecord::default();
    for record in records {
        merged.absorb(record);
    }
    merged
}

/// Badge color band for a coverage percentage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Pass,
    Warn,
    Fail,
}

impl Band {
    /// Shields-style badge color.
    pub fn color(self) -> &'static str {
        match self {
            Band::Pass => "brightgreen",
            Band::Warn => "yellow",
            Band::Fail => "red",
        }
    }
}

/// Derived line-coverage statistics for a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageSummary {
    pub total_lines: u64,
    pub covered_lines: u64,
    pub percent: f64,
    pub band: Band,
}

impl CoverageSummary {
    /// Thresholds for badge banding: >= 90 pass, >= 75 warn, else fail.
    const PASS_THRESHOLD: f64 = 90.0;
    const WARN_THRESHOLD: f64 = 75.0;

    /// Compute the summary of a record.
    pub fn of(record: &CoverageRecord) -> Self {
        let mut total = 0u64;
        let mut covered = 0u64;
        for file in record.files.values() {
            total += file.lines.len() as u64;
            covered += file.lines.values().filter(|&&c| c > 0).count() as u64;
        }
        let percent = if total == 0 {
            0.0
        } else {
            covered as f64 * 100.0 / total as f64
        };
        let band = if percent >= Self::PASS_THRESHOLD {
            Band::Pass
        } else if percent >= Self::WARN_THRESHOLD {
            Band::Warn
        } else {
            Band::Fail
        };
        Self {
            total_lines: total,
            covered_lines: covered,
            percent,
            band,
        }
    }
}
