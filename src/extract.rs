use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::document::CompletionDocument;

pub const DEFAULT_BREAKING_KEYWORDS: &[&str] = &["breaking change", "removed api", "incompatible"];

const SECTION_CONFIDENCE: f64 = 0.9;
const FALLBACK_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeItem {
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedChanges {
    pub breaking_changes: Vec<ChangeItem>,
    pub new_features: Vec<ChangeItem>,
    pub bug_fixes: Vec<ChangeItem>,
    pub improvements: Vec<ChangeItem>,
    pub confidence: f64,
    pub ambiguous_items: Vec<String>,
}

/// Turns one completion document into categorised changes.
#[async_trait]
pub trait ChangeExtractor: Send + Sync {
    async fn parse_completion_document(&self, document: &CompletionDocument) -> Result<ExtractedChanges>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Breaking,
    Features,
    Fixes,
    Improvements,
}

fn classify_heading(heading: &str) -> Option<Section> {
    let heading = heading.trim().trim_end_matches(':').to_lowercase();
    if heading.contains("breaking change") {
        Some(Section::Breaking)
    } else if heading.contains("new feature") || heading == "features" {
        Some(Section::Features)
    } else if heading.contains("bug fix") || heading == "fixes" {
        Some(Section::Fixes)
    } else if heading.contains("improvement") {
        Some(Section::Improvements)
    } else {
        None
    }
}

fn bullet_text(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("+ "))
        .or_else(|| {
            let digits = line.find(|c: char| !c.is_ascii_digit())?;
            (digits > 0).then(|| line[digits..].strip_prefix(". "))?
        })?;
    let rest = rest.trim();
    let placeholder = rest.eq_ignore_ascii_case("none") || rest.eq_ignore_ascii_case("n/a");
    (!rest.is_empty() && !placeholder).then_some(rest)
}

/// Reads bullet lists under well-known headings. Lines elsewhere that
/// mention a breaking keyword are surfaced as ambiguous.
#[derive(Debug, Clone)]
pub struct SectionChangeExtractor {
    breaking_keywords: Vec<String>,
}

impl Default for SectionChangeExtractor {
    fn default() -> Self {
        Self::with_keywords(DEFAULT_BREAKING_KEYWORDS.iter().copied())
    }
}

impl SectionChangeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            breaking_keywords: keywords.into_iter().map(|k| k.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn extract(&self, document: &CompletionDocument) -> ExtractedChanges {
        let mut changes = ExtractedChanges::default();
        let mut matched_section = false;
        let mut current: Option<Section> = None;

        for line in document.content.lines() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix('#') {
                current = classify_heading(heading.trim_start_matches('#'));
                matched_section |= current.is_some();
                continue;
            }

            if let Some(section) = current {
                if let Some(text) = bullet_text(line) {
                    let item = ChangeItem {
                        text: text.to_string(),
                        source: document.path.clone(),
                    };
                    match section {
                        Section::Breaking => changes.breaking_changes.push(item),
                        Section::Features => changes.new_features.push(item),
                        Section::Fixes => changes.bug_fixes.push(item),
                        Section::Improvements => changes.improvements.push(item),
                    }
                }
                continue;
            }

            let lower = trimmed.to_lowercase();
            if self.breaking_keywords.iter().any(|k| lower.contains(k.as_str())) {
                changes.ambiguous_items.push(trimmed.to_string());
            }
        }

        changes.confidence = if matched_section {
            SECTION_CONFIDENCE
        } else {
            FALLBACK_CONFIDENCE
        };
        changes
    }
}

#[async_trait]
impl ChangeExtractor for SectionChangeExtractor {
    async fn parse_completion_document(&self, document: &CompletionDocument) -> Result<ExtractedChanges> {
        Ok(self.extract(document))
    }
}
