//! # release-impact
//!
//! Incrementally derives release-impact data from completion documents in a
//! source tree. Each run analyses only the documents added since the last
//! successful run and appends the results to a persisted state file.
//!
//! ## Architecture
//!
//! - **caching**: Generic versioned TTL/LRU cache, one instance per region
//! - **monitor**: Named-operation timing and reports
//! - **vcs**: Git subprocess runner behind a trait
//! - **document**: Completion document model and metadata extraction
//! - **scan**: Document naming patterns and filesystem walk
//! - **doc_cache**: Per-file parse cache validated by mtime, age, and content hash
//! - **git**: Batched and cached git queries (release tags, changes since a ref)
//! - **parallel**: Bounded-concurrency task runner with retry and progress
//! - **state**: Durable JSON analysis state
//! - **detector**: New-document detection via git with a full-scan fallback
//! - **collector**: Document loading collaborator
//! - **extract**: Change extraction collaborator
//! - **analyzer**: Analyse-new and append-to-accumulated
//! - **orchestrator**: One end-to-end analysis run

pub mod analyzer;
pub mod caching;
pub mod cli;
pub mod collector;
pub mod config;
pub mod detector;
pub mod doc_cache;
pub mod document;
pub mod error;
pub mod extract;
pub mod git;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod parallel;
pub mod scan;
pub mod state;
pub mod vcs;
