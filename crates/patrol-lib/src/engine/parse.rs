//! Parsing of LLM patrol output
//!
//! The model emits findings as framed blocks:
//!
//! ```text
//! [FINDING]
//! SEVERITY: warning
//! CATEGORY: capacity
//! RESOURCE: qemu/101
//! RESOURCE_TYPE: vm
//! TITLE: Root disk nearly full
//! DESCRIPTION: ...
//! RECOMMENDATION: ...
//! EVIDENCE: disk at 91%
//! [/FINDING]
//! ```
//!
//! Reasoning spans between known marker pairs are stripped before framing
//! is parsed. Label values may span lines until the next label.

use crate::models::{FindingCategory, Severity};

/// Default reasoning-marker pairs stripped from provider output
pub fn default_reasoning_markers() -> Vec<(String, String)> {
    vec![
        ("<think>".to_string(), "</think>".to_string()),
        ("<reasoning>".to_string(), "</reasoning>".to_string()),
    ]
}

/// Remove all spans delimited by the marker pairs, markers included.
/// An unterminated opening marker drops the rest of the text.
pub fn strip_reasoning(text: &str, markers: &[(String, String)]) -> String {
    let mut out = text.to_string();
    for (open, close) in markers {
        loop {
            let Some(start) = out.find(open.as_str()) else {
                break;
            };
            match out[start..].find(close.as_str()) {
                Some(rel_end) => {
                    let end = start + rel_end + close.len();
                    out.replace_range(start..end, "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

/// One parsed finding block, before validation and enrichment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFinding {
    pub severity: Severity,
    pub category: FindingCategory,
    pub resource: String,
    pub resource_type: String,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub evidence: String,
}

impl ParsedFinding {
    /// Stable dedup key derived from the title
    pub fn key(&self) -> String {
        let mut key = String::new();
        let mut last_dash = true;
        for c in self.title.chars().flat_map(|c| c.to_lowercase()) {
            if c.is_ascii_alphanumeric() {
                key.push(c);
                last_dash = false;
            } else if !last_dash {
                key.push('-');
                last_dash = true;
            }
            if key.len() >= 40 {
                break;
            }
        }
        key.trim_matches('-').to_string()
    }
}

const LABELS: &[&str] = &[
    "SEVERITY",
    "CATEGORY",
    "RESOURCE",
    "RESOURCE_TYPE",
    "TITLE",
    "DESCRIPTION",
    "RECOMMENDATION",
    "EVIDENCE",
];

fn labeled(line: &str) -> Option<(&str, &str)> {
    let (label, rest) = line.split_once(':')?;
    let label = label.trim();
    if LABELS.contains(&label) {
        Some((label, rest.trim()))
    } else {
        None
    }
}

fn parse_block(block: &str) -> Option<ParsedFinding> {
    let mut finding = ParsedFinding::default();
    let mut current: Option<(&str, String)> = None;
    let mut seen_title = false;
    let mut seen_resource = false;

    let commit = |finding: &mut ParsedFinding, label: &str, value: String| {
        let value = value.trim().to_string();
        match label {
            "SEVERITY" => finding.severity = Severity::parse_lenient(&value),
            "CATEGORY" => finding.category = FindingCategory::parse_lenient(&value),
            "RESOURCE" => finding.resource = value,
            "RESOURCE_TYPE" => finding.resource_type = value.to_ascii_lowercase(),
            "TITLE" => finding.title = value,
            "DESCRIPTION" => finding.description = value,
            "RECOMMENDATION" => finding.recommendation = value,
            "EVIDENCE" => finding.evidence = value,
            _ => {}
        }
    };

    for line in block.lines() {
        if let Some((label, rest)) = labeled(line) {
            if let Some((prev_label, value)) = current.take() {
                commit(&mut finding, prev_label, value);
            }
            if label == "TITLE" {
                seen_title = true;
            }
            if label == "RESOURCE" {
                seen_resource = true;
            }
            current = Some((label, rest.to_string()));
        } else if let Some((_, value)) = current.as_mut() {
            // Continuation of a multi-line value
            if !value.is_empty() {
                value.push('\n');
            }
            value.push_str(line.trim());
        }
    }
    if let Some((label, value)) = current.take() {
        commit(&mut finding, label, value);
    }

    if seen_title && seen_resource && !finding.title.is_empty() && !finding.resource.is_empty() {
        Some(finding)
    } else {
        None
    }
}

/// Extract all well-formed finding blocks from stripped LLM output.
/// Malformed blocks are skipped, not fatal.
pub fn parse_findings(text: &str) -> Vec<ParsedFinding> {
    let mut out = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("[FINDING]") {
        let after = &rest[start + "[FINDING]".len()..];
        let Some(end) = after.find("[/FINDING]") else {
            break;
        };
        if let Some(finding) = parse_block(&after[..end]) {
            out.push(finding);
        }
        rest = &after[end + "[/FINDING]".len()..];
    }
    out
}

/// Metric a finding claims to be about, inferred from its key and title,
/// with the claimed percentage from the evidence. Used for threshold
/// validation of parsed findings.
pub fn claimed_metric(finding: &ParsedFinding) -> Option<(&'static str, f64)> {
    let haystack = format!(
        "{} {}",
        finding.title.to_ascii_lowercase(),
        finding.evidence.to_ascii_lowercase()
    );
    let metric = if haystack.contains("disk") && finding.resource_type != "storage" {
        "disk"
    } else if haystack.contains("storage") || finding.resource_type == "storage" {
        "usage"
    } else if haystack.contains("memory") || haystack.contains("ram") {
        "memory"
    } else if haystack.contains("cpu") {
        "cpu"
    } else {
        return None;
    };

    let value = first_percent(&finding.evidence)?;
    Some((metric, value))
}

/// First `N%` or `N.M%` occurrence in a text
pub fn first_percent(text: &str) -> Option<f64> {
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !digits.is_empty()) {
            digits.push(c);
        } else if c == '%' && !digits.is_empty() {
            return digits.parse().ok();
        } else {
            digits.clear();
        }
    }
    None
}
