//! Remote orchestration
//!
//! [`Remote`] drives the git executable for fetch, push and pull and turns
//! the raw process output into typed results: stderr is streamed through a
//! [`ProgressDecoder`] while it arrives, and once the process exits the
//! summary lines (plus `.git/FETCH_HEAD` for fetch-like operations) are
//! classified into [`FetchRecord`]s or [`PushRecord`]s. Remote management
//! (create, rename, URL handling, configuration) lives here as well.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{RemoraError, Result};
use crate::models::fetch::{FetchRecord, FetchResults, SUMMARY_MARKERS};
use crate::models::push::{PushRecord, PushResults};
use crate::models::reference::GitRef;
use crate::models::remote::RemoteInfo;
use crate::progress::{Progress, ProgressDecoder};
use crate::safety::{check_options, check_protocol};
use crate::utils::command::{git_command, run_git};

/// Options for a fetch, push or pull invocation.
///
/// The default value performs the plain operation with the refspecs
/// configured for the remote.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Explicit refspecs; empty means the remote's configured ones.
    pub refspecs: Vec<String>,
    /// Remove remote-tracking refs that no longer exist on the remote.
    pub prune: bool,
    /// Fetch or push all tags.
    pub tags: bool,
    /// Allow non-fast-forward updates.
    pub force: bool,
    /// Operate on all remotes (fetch) or all branches (push).
    pub all: bool,
    /// Kill the subprocess if it has not finished after this many seconds.
    pub kill_after_timeout: Option<f64>,
    /// Permit `ext::` and `fd::` transport URLs in refspecs.
    pub allow_unsafe_protocols: bool,
    /// Permit command-execution options such as `--upload-pack`.
    pub allow_unsafe_options: bool,
    /// Additional arguments passed through to git.
    pub options: Vec<String>,
}

impl SyncOptions {
    /// Convenience constructor for the common single-refspec case.
    pub fn with_refspec(refspec: impl Into<String>) -> Self {
        Self {
            refspecs: vec![refspec.into()],
            ..Default::default()
        }
    }
}

/// Captured output of a streamed git invocation.
struct StreamOutput {
    status: ExitStatus,
    stdout_lines: Vec<String>,
}

/// A named remote of a local repository.
///
/// The handle is cheap: it stores the repository path and the remote name,
/// and talks to the repository on each call.
#[derive(Debug, Clone)]
pub struct Remote {
    repo_path: PathBuf,
    name: String,
}

impl Remote {
    /// Creates a handle for an existing remote. No validation is performed;
    /// use [`Remote::exists`] to check for the configuration entry.
    pub fn new(repo_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            name: name.into(),
        }
    }

    /// The remote's name, e.g. `origin`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the repository this remote belongs to.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn open_repo(&self) -> Result<git2::Repository> {
        Ok(git2::Repository::open(&self.repo_path)?)
    }

    /// Like [`Remote::new`], but fails with `RemoteNotFound` if the remote
    /// is not configured.
    pub fn find(repo_path: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let remote = Self::new(repo_path, name);
        if !remote.exists()? {
            return Err(RemoraError::RemoteNotFound(remote.name));
        }
        Ok(remote)
    }

    /// Lists all remotes configured for the repository at `repo_path`.
    pub fn list(repo_path: &Path) -> Result<Vec<RemoteInfo>> {
        let repo = git2::Repository::open(repo_path)?;
        let names = repo.remotes()?;

        let mut remotes = Vec::new();
        for name in names.iter().flatten() {
            let remote = repo.find_remote(name)?;
            remotes.push(RemoteInfo {
                name: name.to_string(),
                url: remote.url().unwrap_or_default().to_string(),
                push_url: remote.pushurl().map(ToString::to_string),
            });
        }
        Ok(remotes)
    }

    /// Adds a new remote and returns a handle to it.
    ///
    /// URLs using an unsafe transport are rejected unless
    /// `allow_unsafe_protocols` is set.
    pub async fn create(
        repo_path: &Path,
        name: &str,
        url: &str,
        allow_unsafe_protocols: bool,
    ) -> Result<Remote> {
        check_protocol(url, allow_unsafe_protocols)?;
        run_git(repo_path, &["remote", "add", "--", name, url]).await?;
        Ok(Remote::new(repo_path, name))
    }

    /// Removes the named remote and its remote-tracking refs.
    pub async fn remove(repo_path: &Path, name: &str) -> Result<()> {
        run_git(repo_path, &["remote", "rm", "--", name]).await?;
        Ok(())
    }

    /// Renames this remote; the handle tracks the new name.
    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        if self.name == new_name {
            return Ok(());
        }
        run_git(&self.repo_path, &["remote", "rename", &self.name, new_name]).await?;
        self.name = new_name.to_string();
        Ok(())
    }

    /// Whether a `remote.<name>` section exists in the repository
    /// configuration. Reads the configuration fresh on every call, so
    /// changes made behind the handle's back are observed.
    pub fn exists(&self) -> Result<bool> {
        let repo = self.open_repo()?;
        let config = repo.config()?.snapshot()?;
        match config.get_string(&format!("remote.{}.url", self.name)) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// All fetch URLs configured for this remote, in configuration order.
    pub async fn urls(&self) -> Result<Vec<String>> {
        let output = run_git(&self.repo_path, &["remote", "get-url", "--all", &self.name]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Replaces a URL of this remote. With `old_url` set, only that entry is
    /// replaced; otherwise the first URL is.
    pub async fn set_url(
        &self,
        new_url: &str,
        old_url: Option<&str>,
        allow_unsafe_protocols: bool,
    ) -> Result<()> {
        check_protocol(new_url, allow_unsafe_protocols)?;
        let mut args = vec!["remote", "set-url", "--", self.name.as_str(), new_url];
        if let Some(old) = old_url {
            args.push(old);
        }
        run_git(&self.repo_path, &args).await?;
        Ok(())
    }

    /// Appends a URL to this remote.
    pub async fn add_url(&self, url: &str, allow_unsafe_protocols: bool) -> Result<()> {
        check_protocol(url, allow_unsafe_protocols)?;
        run_git(
            &self.repo_path,
            &["remote", "set-url", "--add", "--", &self.name, url],
        )
        .await?;
        Ok(())
    }

    /// Deletes a URL from this remote. Git refuses to delete the last
    /// remaining URL; that surfaces as a `Command` error.
    pub async fn delete_url(&self, url: &str) -> Result<()> {
        run_git(
            &self.repo_path,
            &["remote", "set-url", "--delete", "--", &self.name, url],
        )
        .await?;
        Ok(())
    }

    /// Fetches updates for this remote, honoring its configuration
    /// (equivalent to `git remote update <name>`).
    pub async fn update(&self) -> Result<()> {
        run_git(&self.repo_path, &["remote", "update", &self.name]).await?;
        Ok(())
    }

    /// Remote-tracking refs that no longer have a counterpart on the remote.
    /// The refs are reported, not deleted.
    pub async fn stale_refs(&self) -> Result<Vec<GitRef>> {
        let output = run_git(
            &self.repo_path,
            &["remote", "prune", "--dry-run", &self.name],
        )
        .await?;

        let mut refs = Vec::new();
        for line in output.lines() {
            let Some(name) = line.trim().strip_prefix("* [would prune] ") else {
                continue;
            };
            let name = name.trim();
            let path = if name.starts_with("refs/") {
                name.to_string()
            } else {
                format!("refs/remotes/{name}")
            };
            refs.push(GitRef::from_path(&path));
        }
        Ok(refs)
    }

    /// Reads `remote.<name>.<key>` from the repository configuration.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let repo = self.open_repo()?;
        let config = repo.config()?.snapshot()?;
        match config.get_string(&format!("remote.{}.{key}", self.name)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `remote.<name>.<key>` in the repository configuration.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let repo = self.open_repo()?;
        let mut config = repo.config()?;
        config.set_str(&format!("remote.{}.{key}", self.name), value)?;
        Ok(())
    }

    /// Fetches from this remote and classifies every updated ref.
    ///
    /// Progress lines on stderr are delivered to `progress` while the
    /// subprocess runs. A nonzero exit is an error; ref summary lines the
    /// classifier cannot make sense of are logged and skipped rather than
    /// failing the whole operation.
    pub async fn fetch(
        &self,
        opts: &SyncOptions,
        progress: Option<&mut dyn Progress>,
    ) -> Result<FetchResults> {
        self.guard(opts)?;
        let args = self.fetch_args(opts);

        let mut decoder = ProgressDecoder::new(progress);
        let output = self
            .run_streamed(&args, &mut decoder, opts.kill_after_timeout)
            .await?;
        if !output.status.success() {
            return Err(self.command_error(output.status, &decoder));
        }
        self.collect_fetch_records(&decoder)
    }

    /// Pushes to this remote and returns one record per ref git reported.
    ///
    /// Unlike [`Remote::fetch`], a nonzero exit alone is not an error:
    /// partial rejections still exit nonzero while the per-ref records carry
    /// the interesting state. Call [`PushResults::raise_if_error`] to turn
    /// rejected refs into an error. Only a push where git produced no
    /// records at all fails here.
    pub async fn push(
        &self,
        opts: &SyncOptions,
        progress: Option<&mut dyn Progress>,
    ) -> Result<PushResults> {
        self.guard(opts)?;
        let args = self.push_args(opts);

        let mut decoder = ProgressDecoder::new(progress);
        let output = self
            .run_streamed(&args, &mut decoder, opts.kill_after_timeout)
            .await?;

        let mut results = PushResults::default();
        for line in &output.stdout_lines {
            if line.trim().is_empty() {
                continue;
            }
            match PushRecord::from_line(&self.name, line) {
                Ok(record) => results.push(record),
                // "To <url>" and "Done" framing lines land here.
                Err(err) => debug!(%err, line, "skipping non-result push line"),
            }
        }

        if results.is_empty() && !output.status.success() {
            return Err(self.command_error(output.status, &decoder));
        }
        Ok(results)
    }

    /// Fetches from this remote and integrates into the current branch,
    /// classifying fetched refs exactly like [`Remote::fetch`].
    pub async fn pull(
        &self,
        opts: &SyncOptions,
        progress: Option<&mut dyn Progress>,
    ) -> Result<FetchResults> {
        self.guard(opts)?;
        let args = self.pull_args(opts);

        let mut decoder = ProgressDecoder::new(progress);
        let output = self
            .run_streamed(&args, &mut decoder, opts.kill_after_timeout)
            .await?;
        if !output.status.success() {
            return Err(self.command_error(output.status, &decoder));
        }
        self.collect_fetch_records(&decoder)
    }

    /// Runs the safety gate over everything the subprocess would see: the
    /// remote's configured URLs (all of them, fetch and push side), the
    /// explicit refspecs and the passthrough options.
    fn guard(&self, opts: &SyncOptions) -> Result<()> {
        let repo = self.open_repo()?;
        let config = repo.config()?.snapshot()?;
        for key in ["url", "pushurl"] {
            let name = format!("remote.{}.{key}", self.name);
            let mut entries = match config.multivar(&name, None) {
                Ok(entries) => entries,
                Err(err) if err.code() == git2::ErrorCode::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next() {
                if let Some(url) = entry?.value() {
                    check_protocol(url, opts.allow_unsafe_protocols)?;
                }
            }
        }
        for refspec in &opts.refspecs {
            check_protocol(refspec, opts.allow_unsafe_protocols)?;
        }
        check_options(&opts.options, opts.allow_unsafe_options)
    }

    fn fetch_args(&self, opts: &SyncOptions) -> Vec<String> {
        // -v makes git report up-to-date refs too.
        let mut args = vec!["fetch".to_string(), "-v".to_string()];
        if opts.prune {
            args.push("--prune".to_string());
        }
        if opts.tags {
            args.push("--tags".to_string());
        }
        if opts.force {
            args.push("--force".to_string());
        }
        if opts.all {
            args.push("--all".to_string());
        }
        args.extend(opts.options.iter().cloned());
        if !opts.all {
            args.push("--".to_string());
            args.push(self.name.clone());
            args.extend(opts.refspecs.iter().cloned());
        }
        args
    }

    fn push_args(&self, opts: &SyncOptions) -> Vec<String> {
        let mut args = vec!["push".to_string(), "--porcelain".to_string()];
        if opts.prune {
            args.push("--prune".to_string());
        }
        if opts.tags {
            args.push("--tags".to_string());
        }
        if opts.force {
            args.push("--force".to_string());
        }
        if opts.all {
            args.push("--all".to_string());
        }
        args.extend(opts.options.iter().cloned());
        args.push("--".to_string());
        args.push(self.name.clone());
        if !opts.all {
            args.extend(opts.refspecs.iter().cloned());
        }
        args
    }

    fn pull_args(&self, opts: &SyncOptions) -> Vec<String> {
        let mut args = vec!["pull".to_string(), "-v".to_string()];
        if opts.tags {
            args.push("--tags".to_string());
        }
        if opts.force {
            args.push("--force".to_string());
        }
        args.extend(opts.options.iter().cloned());
        args.push("--".to_string());
        args.push(self.name.clone());
        args.extend(opts.refspecs.iter().cloned());
        args
    }

    /// Spawns git and drains both pipes concurrently, feeding stderr into
    /// the progress decoder as it arrives. With a timeout set, an overdue
    /// subprocess is killed and reported as a `Command` error.
    async fn run_streamed(
        &self,
        args: &[String],
        decoder: &mut ProgressDecoder<'_>,
        kill_after_timeout: Option<f64>,
    ) -> Result<StreamOutput> {
        debug!(remote = %self.name, ?args, "spawning git");
        let mut child = git_command(&self.repo_path).args(args).spawn()?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let drained = async {
            let mut stdout_buf = Vec::new();
            let stdout_task = async {
                if let Some(out) = stdout.as_mut() {
                    out.read_to_end(&mut stdout_buf).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let stderr_task = async {
                if let Some(err) = stderr.as_mut() {
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = err.read(&mut chunk).await?;
                        if n == 0 {
                            break;
                        }
                        decoder.feed(&chunk[..n]);
                    }
                }
                decoder.finish();
                Ok::<_, std::io::Error>(())
            };
            let (stdout_res, stderr_res) = tokio::join!(stdout_task, stderr_task);
            stdout_res?;
            stderr_res?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout_buf))
        };

        let (status, stdout_buf) = match kill_after_timeout {
            Some(secs) => {
                // Bind the timeout result first so the future (and its
                // borrows of the child) is dropped before the kill below.
                let result =
                    tokio::time::timeout(Duration::from_secs_f64(secs), drained).await;
                match result {
                    Ok(drained) => drained?,
                    Err(_) => {
                        warn!(remote = %self.name, secs, "git did not finish in time, killing it");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(RemoraError::Command {
                            status: -15,
                            stderr: format!(
                                "subprocess killed after kill_after_timeout={secs} s"
                            ),
                        });
                    }
                }
            }
            None => drained.await?,
        };

        Ok(StreamOutput {
            status,
            stdout_lines: String::from_utf8_lossy(&stdout_buf)
                .lines()
                .map(str::to_string)
                .collect(),
        })
    }

    fn command_error(&self, status: ExitStatus, decoder: &ProgressDecoder<'_>) -> RemoraError {
        let detail = if decoder.error_lines().is_empty() {
            let tail: Vec<&str> = decoder
                .other_lines()
                .iter()
                .rev()
                .take(5)
                .map(String::as_str)
                .collect();
            tail.into_iter().rev().collect::<Vec<_>>().join("\n")
        } else {
            decoder.error_lines().join("\n")
        };
        RemoraError::Command {
            status: status.code().unwrap_or(-1),
            stderr: detail,
        }
    }

    /// Pairs the ref summary lines git printed to stderr with the entries
    /// git wrote to `.git/FETCH_HEAD`, in order, and classifies each pair.
    fn collect_fetch_records(&self, decoder: &ProgressDecoder<'_>) -> Result<FetchResults> {
        let repo = self.open_repo()?;
        let fetch_head = repo.path().join("FETCH_HEAD");
        let fetch_head_info = std::fs::read_to_string(&fetch_head).unwrap_or_default();
        let head_lines: Vec<&str> = fetch_head_info
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();

        let summary_lines: Vec<&String> = decoder
            .other_lines()
            .iter()
            .filter(|line| is_summary_line(line))
            .collect();

        let count = summary_lines.len().min(head_lines.len());
        if summary_lines.len() != head_lines.len() {
            warn!(
                summaries = summary_lines.len(),
                entries = head_lines.len(),
                "fetch summary count does not match FETCH_HEAD, pairing the common prefix"
            );
        }

        let mut results = FetchResults::default();
        for (line, fetch_line) in summary_lines.iter().zip(head_lines.iter()).take(count) {
            match FetchRecord::from_line(&repo, line, fetch_line) {
                Ok(record) => results.push(record),
                Err(err) => warn!(%err, line = line.as_str(), "skipping unclassifiable fetch line"),
            }
        }
        Ok(results)
    }
}

/// Whether a stderr line is a per-ref summary: one leading space followed by
/// an update marker.
fn is_summary_line(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next() == Some(' ')
        && chars
            .next()
            .is_some_and(|marker| SUMMARY_MARKERS.contains(&marker))
}
