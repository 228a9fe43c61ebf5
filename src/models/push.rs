//! Push result models
//!
//! With `--porcelain` git push writes one machine-readable line per ref to
//! stdout:
//!
//! ```text
//! <flag>\t<from>:<to>\t<summary>
//! ```
//!
//! e.g. ` \trefs/heads/master:refs/heads/master\t86ab644..d850e0e` for a
//! fast-forward or `!\trefs/heads/master:refs/heads/master\t[rejected]
//! (non-fast-forward)` for a refused update. Per-ref failures are data, not
//! errors; [`PushResults::raise_if_error`] promotes them on request.

use bitflags::bitflags;
use serde::Serialize;

use crate::error::{RemoraError, Result};
use crate::models::reference::GitRef;

bitflags! {
    /// Outcome flags of pushing one ref.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PushFlags: u32 {
        const NEW_TAG = 1 << 0;
        const NEW_HEAD = 1 << 1;
        const NO_MATCH = 1 << 2;
        const REJECTED = 1 << 3;
        const REMOTE_REJECTED = 1 << 4;
        const REMOTE_FAILURE = 1 << 5;
        const DELETED = 1 << 6;
        const FORCED_UPDATE = 1 << 7;
        const FAST_FORWARD = 1 << 8;
        const UP_TO_DATE = 1 << 9;
        const ERROR = 1 << 10;

        /// Everything that makes a record count as failed.
        const ANY_REJECTION = Self::NO_MATCH.bits()
            | Self::REJECTED.bits()
            | Self::REMOTE_REJECTED.bits()
            | Self::REMOTE_FAILURE.bits();
    }
}

// Serialized as the flag names, e.g. "REJECTED | ERROR".
impl Serialize for PushFlags {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut names = String::new();
        bitflags::parser::to_writer(self, &mut names).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&names)
    }
}

fn flag_char(c: char) -> Option<PushFlags> {
    match c {
        'X' => Some(PushFlags::NO_MATCH | PushFlags::ERROR),
        '-' => Some(PushFlags::DELETED),
        '*' => Some(PushFlags::empty()),
        '+' => Some(PushFlags::FORCED_UPDATE),
        ' ' => Some(PushFlags::FAST_FORWARD),
        '=' => Some(PushFlags::UP_TO_DATE),
        '!' => Some(PushFlags::ERROR),
        _ => None,
    }
}

/// The outcome of pushing one local ref.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRecord {
    /// The pushed local ref. Absent when the push deleted a remote ref.
    pub local_ref: Option<GitRef>,
    /// The remote-side ref: a tag, or the remote-tracking ref of the
    /// updated branch.
    pub remote_ref: GitRef,
    pub flags: PushFlags,
    /// The summary column as printed by git.
    pub summary: String,
    /// Hex id of the previous remote tip, as printed (may be abbreviated).
    pub old_commit: Option<String>,
}

impl PushRecord {
    /// Parse one `--porcelain` stdout line.
    ///
    /// `remote_name` qualifies branch targets into
    /// `refs/remotes/<remote>/...`.
    pub fn from_line(remote_name: &str, line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).splitn(3, '\t');
        let (Some(flag_field), Some(from_to), Some(summary)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(RemoraError::Parse(format!(
                "failed to parse push line: {line:?}"
            )));
        };

        let flag = flag_field.chars().next().unwrap_or(' ');
        let mut flags = flag_char(flag).ok_or_else(|| {
            RemoraError::Parse(format!("unknown flag {flag:?} in push line: {line:?}"))
        })?;

        let (from, to) = from_to.split_once(':').ok_or_else(|| {
            RemoraError::Parse(format!("missing refspec in push line: {line:?}"))
        })?;

        let mut old_commit = None;
        if summary.starts_with('[') {
            if summary.starts_with("[rejected]") {
                flags |= PushFlags::REJECTED | PushFlags::ERROR;
            } else if summary.starts_with("[remote rejected]") {
                flags |= PushFlags::REMOTE_REJECTED | PushFlags::ERROR;
            } else if summary.starts_with("[remote failure]") {
                flags |= PushFlags::REMOTE_FAILURE | PushFlags::ERROR;
            } else if summary.starts_with("[no match]") {
                flags |= PushFlags::NO_MATCH | PushFlags::ERROR;
            } else if summary.starts_with("[new tag]") {
                flags |= PushFlags::NEW_TAG;
            } else if summary.starts_with("[new branch]") {
                flags |= PushFlags::NEW_HEAD;
            }
            // "[up to date]" and "[deleted]" are already encoded in the
            // flag character.
        } else if let Some(range) = summary.split_whitespace().next() {
            let old = range
                .split_once("...")
                .or_else(|| range.split_once(".."))
                .map(|(old, _)| old);
            if let Some(old) = old.filter(|o| !o.is_empty()) {
                old_commit = Some(old.to_string());
            }
        }

        // A creation without a summary token: decide by the target path.
        if flag == '*' && !flags.intersects(PushFlags::NEW_TAG | PushFlags::NEW_HEAD) {
            flags |= if to.starts_with("refs/tags/") {
                PushFlags::NEW_TAG
            } else {
                PushFlags::NEW_HEAD
            };
        }

        let local_ref = if flags.contains(PushFlags::DELETED) || from == "(delete)" || from.is_empty()
        {
            None
        } else {
            Some(GitRef::from_path(from))
        };

        let remote_ref = if to.starts_with("refs/tags/") {
            GitRef::from_path(to)
        } else if let Some(branch) = to.strip_prefix("refs/heads/") {
            GitRef::remote_tracking(remote_name, branch)
        } else {
            return Err(RemoraError::Parse(format!(
                "could not handle remote ref: {to:?}"
            )));
        };

        Ok(Self {
            local_ref,
            remote_ref,
            flags,
            summary: summary.trim().to_string(),
            old_commit,
        })
    }

    /// Whether this record represents a failed ref update.
    pub fn is_error(&self) -> bool {
        self.flags.contains(PushFlags::ERROR)
    }
}

/// Ordered push results.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct PushResults {
    records: Vec<PushRecord>,
}

impl PushResults {
    pub(crate) fn push(&mut self, record: PushRecord) {
        self.records.push(record);
    }

    /// Fail with a command error summarizing all rejected refs; no-op when
    /// every ref was accepted.
    pub fn raise_if_error(&self) -> Result<()> {
        let failed: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.is_error())
            .map(|r| format!("{}: {}", r.remote_ref.name(), r.summary))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(RemoraError::Command {
            status: 1,
            stderr: format!("some refs were not pushed: {}", failed.join("; ")),
        })
    }
}

impl std::ops::Deref for PushResults {
    type Target = [PushRecord];

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

impl IntoIterator for PushResults {
    type Item = PushRecord;
    type IntoIter = std::vec::IntoIter<PushRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a PushResults {
    type Item = &'a PushRecord;
    type IntoIter = std::slice::Iter<'a, PushRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
