//! Token-budgeted seed assembly
//!
//! The seed is the context block handed to the LLM for a patrol run. It is
//! assembled from prioritized sections under a hard token budget:
//!
//! - P0 (inventory summary, previous-run digest) and P1 (scoped resource
//!   details) are always included in full.
//! - P2 (metrics history and baselines) degrades to its summary form when
//!   the full form does not fit, and is dropped when neither fits.
//! - P3 (correlations, patterns) and P4 (hints, notes, forecasts) are
//!   included greedily while budget remains.
//!
//! When P0+P1 alone exceed the budget the engine proceeds with them anyway
//! and the overflow is reported.

use tracing::warn;

/// Smallest budget ever used
pub const TOKEN_BUDGET_FLOOR: u32 = 4_096;

/// Largest budget ever used
pub const TOKEN_BUDGET_CAP: u32 = 160_000;

/// Budget when the model context window is unknown
pub const TOKEN_BUDGET_FALLBACK: u32 = 92_000;

/// Estimate tokens for a string: `(len_bytes + 3) / 4`
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

/// Budget for a model: half its context window, clamped to the floor/cap
pub fn compute_budget(model_context_window: Option<u32>) -> u32 {
    match model_context_window {
        Some(window) => (window / 2).clamp(TOKEN_BUDGET_FLOOR, TOKEN_BUDGET_CAP),
        None => TOKEN_BUDGET_FALLBACK,
    }
}

/// Form a section was included in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionForm {
    Full,
    Summary,
}

/// One prioritized seed section
#[derive(Debug, Clone)]
pub struct SeedSection {
    /// 0 (must include) through 4 (best effort)
    pub priority: u8,
    pub title: String,
    pub full: String,
    /// Degraded form; only P2 sections provide one
    pub summary: Option<String>,
}

impl SeedSection {
    pub fn new(priority: u8, title: impl Into<String>, full: impl Into<String>) -> Self {
        Self {
            priority,
            title: title.into(),
            full: full.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Assembled seed plus packing diagnostics
#[derive(Debug, Clone)]
pub struct SeedOutput {
    pub text: String,
    pub used_tokens: u32,
    pub budget: u32,
    /// Included sections with the form used
    pub included: Vec<(String, SectionForm)>,
    /// Sections that did not fit
    pub dropped: Vec<String>,
    /// P0/P1 alone exceeded the budget
    pub overflow: bool,
}

fn render(title: &str, body: &str) -> String {
    format!("## {title}\n{body}")
}

fn appended_tokens(current: &str, addition: &str) -> u32 {
    if current.is_empty() {
        estimate_tokens(addition)
    } else {
        estimate_tokens(addition) + estimate_tokens("\n\n")
    }
}

fn append(text: &mut String, addition: &str) {
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(addition);
}

/// Pack sections into the budget. Sections are considered in priority order,
/// preserving insertion order within a priority.
pub fn assemble(sections: &[SeedSection], budget: u32) -> SeedOutput {
    let mut ordered: Vec<&SeedSection> = sections.iter().collect();
    ordered.sort_by_key(|s| s.priority);

    let mut text = String::new();
    let mut used: u32 = 0;
    let mut included = Vec::new();
    let mut dropped = Vec::new();

    // P0 and P1 are unconditional
    for section in ordered.iter().filter(|s| s.priority <= 1) {
        let body = render(&section.title, &section.full);
        used += appended_tokens(&text, &body);
        append(&mut text, &body);
        included.push((section.title.clone(), SectionForm::Full));
    }

    let overflow = used > budget;
    if overflow {
        warn!(
            used_tokens = used,
            budget, "Seed P0/P1 sections exceed the token budget, proceeding without extras"
        );
        for section in ordered.iter().filter(|s| s.priority > 1) {
            dropped.push(section.title.clone());
        }
        return SeedOutput {
            text,
            used_tokens: used,
            budget,
            included,
            dropped,
            overflow,
        };
    }

    // P2 degrades to its summary before being dropped
    for section in ordered.iter().filter(|s| s.priority == 2) {
        let full_body = render(&section.title, &section.full);
        let full_cost = appended_tokens(&text, &full_body);
        if used + full_cost <= budget {
            used += full_cost;
            append(&mut text, &full_body);
            included.push((section.title.clone(), SectionForm::Full));
            continue;
        }

        if let Some(summary) = &section.summary {
            let summary_body = render(&format!("{} (summary)", section.title), summary);
            let summary_cost = appended_tokens(&text, &summary_body);
            if used + summary_cost <= budget {
                used += summary_cost;
                append(&mut text, &summary_body);
                included.push((section.title.clone(), SectionForm::Summary));
                continue;
            }
        }
        dropped.push(section.title.clone());
    }

    // P3 then P4, greedily
    for section in ordered.iter().filter(|s| s.priority >= 3) {
        let body = render(&section.title, &section.full);
        let cost = appended_tokens(&text, &body);
        if used + cost <= budget {
            used += cost;
            append(&mut text, &body);
            included.push((section.title.clone(), SectionForm::Full));
        } else {
            dropped.push(section.title.clone());
        }
    }

    SeedOutput {
        text,
        used_tokens: used,
        budget,
        included,
        dropped,
        overflow,
    }
}
