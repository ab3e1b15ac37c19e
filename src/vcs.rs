use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::ReleaseImpactError;

pub const GIT_BINARY_ENV: &str = "RELEASE_IMPACT_GIT";

/// Prepended to every invocation so non-ASCII paths come back verbatim
/// instead of C-quoted.
const GIT_DEFAULT_ARGS: [&str; 2] = ["-c", "core.quotePath=false"];

/// Runs version-control commands. Returns stdout on success and an error
/// carrying stderr on a non-zero exit.
#[async_trait]
pub trait VcsRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String>;

    fn working_dir(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    working_dir: PathBuf,
    binary: String,
}

impl GitCli {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let binary = std::env::var(GIT_BINARY_ENV).unwrap_or_else(|_| "git".to_string());
        Self {
            working_dir: working_dir.into(),
            binary,
        }
    }

    pub fn with_binary(working_dir: impl Into<PathBuf>, binary: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl VcsRunner for GitCli {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(GIT_DEFAULT_ARGS)
            .args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {} (ensure git is installed)", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReleaseImpactError::Vcs {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::write_script;
    use super::*;

    #[tokio::test]
    async fn run_returns_stdout_on_success() -> Result<()> {
        let base = tempfile::tempdir()?;
        let fake_git = base.path().join("git");
        write_script(
            &fake_git,
            r#"#!/bin/sh
if [ "$3" = "rev-parse" ] && [ "$4" = "HEAD" ]; then
  echo "0123456789abcdef"
else
  echo "unexpected args: $*" >&2
  exit 1
fi
"#,
        )?;

        let git = GitCli::with_binary(base.path(), fake_git.to_string_lossy());
        let out = git.run(&["rev-parse", "HEAD"]).await?;
        assert_eq!(out.trim(), "0123456789abcdef");
        Ok(())
    }

    #[tokio::test]
    async fn run_surfaces_stderr_on_failure() -> Result<()> {
        let base = tempfile::tempdir()?;
        let fake_git = base.path().join("git");
        write_script(
            &fake_git,
            r#"#!/bin/sh
echo "fatal: not a git repository" >&2
exit 128
"#,
        )?;

        let git = GitCli::with_binary(base.path(), fake_git.to_string_lossy());
        let err = git.run(&["status"]).await.unwrap_err();
        let typed = err.downcast_ref::<ReleaseImpactError>();
        assert!(matches!(
            typed,
            Some(ReleaseImpactError::Vcs { command, stderr })
                if command == "status" && stderr.contains("not a git repository")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn paths_are_requested_unquoted() -> Result<()> {
        let base = tempfile::tempdir()?;
        let fake_git = base.path().join("git");
        write_script(
            &fake_git,
            r#"#!/bin/sh
echo "$@"
"#,
        )?;

        let git = GitCli::with_binary(base.path(), fake_git.to_string_lossy());
        let out = git.run(&["diff", "--name-status", "a", "b"]).await?;
        assert_eq!(out.trim(), "-c core.quotePath=false diff --name-status a b");
        Ok(())
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let git = GitCli::with_binary(".", "/definitely/not/a/git/binary");
        assert!(git.run(&["status"]).await.is_err());
    }
}
