use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+)$").expect("valid regex literal"));
static TASK_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"task-(\d+(?:\.\d+)*)-").expect("valid regex literal"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    TaskCompletion,
    SpecCompletion,
    #[default]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub date: Option<String>,
    pub task: Option<String>,
    pub spec: Option<String>,
    pub status: Option<String>,
    pub doc_type: DocumentType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDocument {
    /// Repository-relative, forward-slash separated.
    pub path: String,
    pub content: String,
    pub last_modified: DateTime<Utc>,
    /// Last commit that touched the file; empty when unknown.
    pub git_commit: String,
    pub metadata: DocumentMetadata,
}

pub fn extract_document_metadata(content: &str, file_path: &str) -> DocumentMetadata {
    let normalized = content.replace("\r\n", "\n");
    let title = TITLE_RE
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    DocumentMetadata {
        title,
        date: header_field(&normalized, "Date"),
        task: header_field(&normalized, "Task"),
        spec: header_field(&normalized, "Spec"),
        status: header_field(&normalized, "Status"),
        doc_type: classify_path(file_path),
    }
}

fn header_field(content: &str, name: &str) -> Option<String> {
    let prefix = format!("**{name}**:");
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix(&prefix)?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

pub fn classify_path(file_path: &str) -> DocumentType {
    let file_name = file_name(file_path);
    if file_name.contains("spec-completion") {
        return DocumentType::SpecCompletion;
    }
    if file_name.contains("task-")
        && (file_name.ends_with("-completion.md") || file_name.ends_with("-summary.md"))
    {
        return DocumentType::TaskCompletion;
    }
    DocumentType::Other
}

/// The directory following `specs/`, else the parent directory name.
pub fn spec_name_from_path(file_path: &str) -> String {
    let parts: Vec<&str> = file_path.split('/').filter(|p| !p.is_empty()).collect();
    if let Some(idx) = parts.iter().position(|p| *p == "specs")
        && idx + 2 < parts.len()
    {
        return parts[idx + 1].to_string();
    }

    parts
        .len()
        .checked_sub(2)
        .and_then(|i| parts.get(i))
        .map(|s| (*s).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn task_number_from_path(file_path: &str) -> String {
    TASK_NUMBER_RE
        .captures(file_name(file_path))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn file_name(file_path: &str) -> &str {
    file_path.rsplit('/').next().unwrap_or(file_path)
}

pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_and_header_fields() {
        let content = "# Task 1 Summary: Implement Feature A\r\n\r\n**Date**: 2025-01-15\r\n**Task**: 1. Implement feature A\r\n**Spec**: 001-test-spec\r\n\r\n## What\r\n\r\nBody\r\n";
        let meta = extract_document_metadata(content, "docs/specs/001-test-spec/task-1-summary.md");

        assert_eq!(meta.title, "Task 1 Summary: Implement Feature A");
        assert_eq!(meta.date.as_deref(), Some("2025-01-15"));
        assert_eq!(meta.task.as_deref(), Some("1. Implement feature A"));
        assert_eq!(meta.spec.as_deref(), Some("001-test-spec"));
        assert_eq!(meta.status, None);
        assert_eq!(meta.doc_type, DocumentType::TaskCompletion);
    }

    #[test]
    fn classifies_by_file_name() {
        assert_eq!(
            classify_path(".kiro/specs/a/completion/task-2-completion.md"),
            DocumentType::TaskCompletion
        );
        assert_eq!(
            classify_path("specs/a/completion/spec-completion-summary.md"),
            DocumentType::SpecCompletion
        );
        assert_eq!(classify_path("README.md"), DocumentType::Other);
    }

    #[test]
    fn spec_name_and_task_number_come_from_path() {
        let path = ".kiro/specs/002-new/completion/task-1-completion.md";
        assert_eq!(spec_name_from_path(path), "002-new");
        assert_eq!(task_number_from_path(path), "1");

        assert_eq!(task_number_from_path("docs/specs/x/task-3.2-summary.md"), "3.2");
        assert_eq!(spec_name_from_path("notes/feature-x/task-4-summary.md"), "feature-x");
        assert_eq!(task_number_from_path("notes/summary.md"), "unknown");
        assert_eq!(spec_name_from_path("summary.md"), "unknown");
    }

    #[test]
    fn hash_content_is_hex_sha256() {
        assert_eq!(
            hash_content("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
