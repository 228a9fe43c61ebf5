//! Command utilities for spawning the git executable
//!
//! All subprocess invocations go through here so the environment is
//! consistent: no credential prompts, untranslated output, hidden console
//! windows on Windows.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{RemoraError, Result};

/// Creates a git command rooted at `workdir` with both output streams piped.
pub fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);

    // Prevent git credential prompts; a library cannot answer them.
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    // Summary parsing relies on untranslated output.
    cmd.env("LC_ALL", "C");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "windows")]
    {
        // CREATE_NO_WINDOW = 0x08000000
        // This prevents the console window from appearing
        cmd.creation_flags(0x08000000);
    }

    cmd
}

/// Runs a git command to completion and returns its trimmed stdout.
///
/// A nonzero exit becomes a `Command` error carrying the exit code and
/// whatever git printed to stderr (falling back to stdout).
pub async fn run_git(workdir: &Path, args: &[&str]) -> Result<String> {
    debug!(?args, "running git");
    let output = git_command(workdir).args(args).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(stdout.trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(RemoraError::Command {
            status: output.status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}
