use anyhow::{Context, Result, bail};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::Path;
use std::sync::mpsc;

use crate::document::normalize_relative;

pub const DEFAULT_DOCUMENT_PATTERNS: &[&str] = &["**/task-*-summary.md", "**/task-*-completion.md"];

/// Naming convention for completion documents, matched against
/// repository-relative forward-slash paths.
#[derive(Debug, Clone)]
pub struct DocumentPatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl DocumentPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern.as_ref())
                .literal_separator(true)
                .build()
                .with_context(|| format!("Invalid document pattern: {}", pattern.as_ref()))?;
            builder.add(glob);
        }
        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        self.set.is_match(relative_path)
    }

    pub fn filter<'a, I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        paths
            .into_iter()
            .filter(|p| self.matches(p))
            .cloned()
            .collect()
    }
}

impl Default for DocumentPatterns {
    fn default() -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_DOCUMENT_PATTERNS {
            if let Ok(glob) = GlobBuilder::new(pattern).literal_separator(true).build() {
                builder.add(glob);
            }
        }
        Self {
            patterns: DEFAULT_DOCUMENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            set: builder.build().unwrap_or_else(|_| GlobSet::empty()),
        }
    }
}

/// Walks `root` and returns every matching document, sorted. `.git` and
/// gitignored paths are skipped; hidden directories such as `.kiro` are
/// walked.
pub fn scan_documents(root: &Path, patterns: &DocumentPatterns) -> Result<Vec<String>> {
    if !root.is_dir() {
        bail!("Document root is not a directory: {}", root.display());
    }

    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.file_type().is_some_and(|t| t.is_file())
                && let Ok(relative) = entry.path().strip_prefix(root)
            {
                let relative = normalize_relative(relative);
                if patterns.matches(&relative) {
                    let _ = tx.send(relative);
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut found: Vec<String> = rx.iter().collect();
    found.sort();
    Ok(found)
}
