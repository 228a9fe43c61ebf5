//! Fetch result models
//!
//! A fetch reports one summary line per affected ref on stderr, e.g.
//!
//! ```text
//!  * [new branch]      feature    -> origin/feature
//!    86ab644..d850e0e  master     -> origin/master
//!  + 1aa84f3...86ab644 master     -> origin/master  (forced update)
//! ```
//!
//! and writes one matching entry per ref to `.git/FETCH_HEAD`:
//!
//! ```text
//! d850e0e...\tnot-for-merge\tbranch 'master' of /tmp/origin
//! ```
//!
//! [`FetchRecord::from_line`] classifies one such pair into flags, a typed
//! local ref and, for fast-forwards and forced updates, the previous commit.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{RemoraError, Result};
use crate::models::reference::{resolve_fetch_ref, GitRef};

bitflags! {
    /// Outcome flags of fetching one ref.
    ///
    /// `FORCED_UPDATE` and `FAST_FORWARD` are modifiers; the remaining
    /// flags describe the kind of outcome.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        const NEW_TAG = 1 << 0;
        const NEW_HEAD = 1 << 1;
        const HEAD_UPTODATE = 1 << 2;
        const TAG_UPDATE = 1 << 3;
        const REJECTED = 1 << 4;
        const FORCED_UPDATE = 1 << 5;
        const FAST_FORWARD = 1 << 6;
        const ERROR = 1 << 7;
    }
}

// Serialized as the flag names, e.g. "REJECTED | ERROR".
impl Serialize for FetchFlags {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut names = String::new();
        bitflags::parser::to_writer(self, &mut names).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&names)
    }
}

/// Leading marker character of a fetch summary line.
fn marker_flags(marker: char) -> Option<FetchFlags> {
    match marker {
        '!' => Some(FetchFlags::ERROR),
        '+' => Some(FetchFlags::FORCED_UPDATE),
        '*' => Some(FetchFlags::empty()),
        '=' => Some(FetchFlags::HEAD_UPTODATE),
        ' ' => Some(FetchFlags::FAST_FORWARD),
        '-' | 't' => Some(FetchFlags::TAG_UPDATE),
        _ => None,
    }
}

/// Marker characters that identify a fetch summary line on stderr.
pub(crate) const SUMMARY_MARKERS: &[char] = &['!', '+', '*', '=', ' ', '-', 't'];

static RE_FETCH_RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(.) (\[[\w \.$@]+\]|[\w\.$@]+\.{2,3}[\w\.$@]+)\s+(\S+)\s+->\s+(\S+?)(?:\s+\((.*)\))?\s*$",
    )
    .unwrap()
});

/// The outcome of fetching one remote ref.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRecord {
    /// The remote-side ref as reported on the summary line.
    pub remote_ref_path: String,
    /// The local ref the fetch wrote to, if any.
    pub local_ref: Option<GitRef>,
    pub flags: FetchFlags,
    /// Free-text remainder of the summary line (e.g. `forced update`).
    pub note: String,
    /// Full hex id of the previous tip. Present only on fast-forwards and
    /// forced updates.
    pub old_commit: Option<String>,
}

impl FetchRecord {
    /// Classify one stderr summary line paired with its FETCH_HEAD entry.
    ///
    /// The repository is consulted to resolve the abbreviated pre-update
    /// commit id on fast-forward and forced-update lines.
    pub fn from_line(repo: &git2::Repository, line: &str, fetch_line: &str) -> Result<Self> {
        let captures = RE_FETCH_RESULT
            .captures(line)
            .ok_or_else(|| RemoraError::Parse(format!("failed to parse line: {line:?}")))?;

        let marker = captures[1]
            .chars()
            .next()
            .ok_or_else(|| RemoraError::Parse(format!("missing marker in line: {line:?}")))?;
        let status = &captures[2];
        let remote_ref_path = captures[3].to_string();
        let reported_local = captures[4].to_string();
        let note = captures
            .get(5)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        // The FETCH_HEAD entry tells us what kind of ref was fetched.
        let mut parts = fetch_line.trim_end().splitn(3, '\t');
        let (Some(_sha), Some(_merge_flag), Some(head_note)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RemoraError::Parse(format!(
                "failed to parse FETCH_HEAD entry: {fetch_line:?}"
            )));
        };
        let ref_type_token = head_note.split(' ').next().unwrap_or_default();

        let mut flags = marker_flags(marker).ok_or_else(|| {
            RemoraError::Parse(format!("unknown marker {marker:?} in line: {line:?}"))
        })?;

        let mut old_commit = None;
        if status.starts_with('[') {
            flags |= match status {
                "[rejected]" => FetchFlags::REJECTED | FetchFlags::ERROR,
                "[new tag]" => FetchFlags::NEW_TAG,
                "[tag update]" => FetchFlags::TAG_UPDATE,
                "[new branch]" | "[new ref]" => FetchFlags::NEW_HEAD,
                "[up to date]" => FetchFlags::HEAD_UPTODATE,
                _ => {
                    return Err(RemoraError::Parse(format!(
                        "unknown status {status:?} in line: {line:?}"
                    )))
                }
            };
        } else if let Some((old, _new)) = split_sha_range(status) {
            flags |= if status.contains("...") {
                FetchFlags::FORCED_UPDATE
            } else {
                FetchFlags::FAST_FORWARD
            };
            let object = repo.revparse_single(old)?;
            old_commit = Some(object.id().to_string());
        } else {
            return Err(RemoraError::Parse(format!(
                "unknown status {status:?} in line: {line:?}"
            )));
        }

        let is_tag_operation =
            flags.intersects(FetchFlags::NEW_TAG | FetchFlags::TAG_UPDATE);
        let local_ref = if reported_local == "(none)" {
            None
        } else {
            Some(resolve_fetch_ref(
                &reported_local,
                ref_type_token,
                is_tag_operation,
            )?)
        };

        Ok(Self {
            remote_ref_path,
            local_ref,
            flags,
            note,
            old_commit,
        })
    }

    /// Lookup name of this record: the local ref's display name.
    pub fn name(&self) -> &str {
        self.local_ref
            .as_ref()
            .map(|r| r.name())
            .unwrap_or(&self.remote_ref_path)
    }
}

/// Split a `<old>..<new>` or `<old>...<new>` range into its two ids.
fn split_sha_range(status: &str) -> Option<(&str, &str)> {
    let (old, new) = if let Some(pair) = status.split_once("...") {
        pair
    } else {
        status.split_once("..")?
    };
    if old.is_empty() || new.is_empty() {
        return None;
    }
    Some((old, new))
}

/// Ordered fetch results, additionally indexable by ref display name
/// (e.g. `origin/master`).
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct FetchResults {
    records: Vec<FetchRecord>,
}

impl FetchResults {
    pub(crate) fn push(&mut self, record: FetchRecord) {
        self.records.push(record);
    }

    /// Look a record up by its ref display name.
    pub fn get(&self, name: &str) -> Option<&FetchRecord> {
        self.records.iter().find(|r| r.name() == name)
    }
}

impl std::ops::Deref for FetchResults {
    type Target = [FetchRecord];

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

impl IntoIterator for FetchResults {
    type Item = FetchRecord;
    type IntoIter = std::vec::IntoIter<FetchRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a FetchResults {
    type Item = &'a FetchRecord;
    type IntoIter = std::slice::Iter<'a, FetchRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reference::RefKind;
    use crate::test_utils::TestRepo;

    const FETCH_HEAD_BRANCH: &str =
        "c437ee5deb8d00cf02f03720693e4c802e99f390\tnot-for-merge\tbranch '0.3' of /tmp/origin";
    const FETCH_HEAD_TAG: &str =
        "c437ee5deb8d00cf02f03720693e4c802e99f390\tnot-for-merge\ttag '0.3' of /tmp/origin";

    fn parse(line: &str, fetch_line: &str) -> Result<FetchRecord> {
        let repo = TestRepo::with_initial_commit();
        FetchRecord::from_line(&repo.repo(), line, fetch_line)
    }

    #[test]
    fn test_nonsense_line_fails() {
        assert!(matches!(
            parse("nonsense", ""),
            Err(RemoraError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_marker_fails() {
        let res = parse(
            "? [up to date]      0.1.7RC    -> origin/0.1.7RC",
            FETCH_HEAD_BRANCH,
        );
        assert!(matches!(res, Err(RemoraError::Parse(_))));
    }

    #[test]
    fn test_missing_fetch_head_entry_fails() {
        let res = parse("* [new branch]      master     -> origin/master", "");
        assert!(matches!(res, Err(RemoraError::Parse(_))));
    }

    #[test]
    fn test_new_branch() {
        let record = parse(
            "* [new branch]      nomatter     -> local/master",
            FETCH_HEAD_BRANCH,
        )
        .unwrap();
        assert_eq!(record.flags, FetchFlags::NEW_HEAD);
        assert_eq!(record.remote_ref_path, "nomatter");
        let local = record.local_ref.unwrap();
        assert_eq!(local.kind, RefKind::RemoteTracking);
        assert_eq!(local.name(), "local/master");
    }

    #[test]
    fn test_new_tag() {
        let record = parse(
            "* [new tag]         v1.0         -> v1.0",
            FETCH_HEAD_TAG,
        )
        .unwrap();
        assert_eq!(record.flags, FetchFlags::NEW_TAG);
        let local = record.local_ref.unwrap();
        assert_eq!(local.kind, RefKind::Tag);
        assert_eq!(local.path, "refs/tags/v1.0");
    }

    #[test]
    fn test_tag_in_remote_namespace() {
        let record = parse(
            "* [new tag]         v1.0         -> origin/tags/v1.0",
            FETCH_HEAD_TAG,
        )
        .unwrap();
        let local = record.local_ref.unwrap();
        assert_eq!(local.kind, RefKind::Tag);
        assert_eq!(local.path, "refs/remotes/origin/tags/v1.0");
    }

    #[test]
    fn test_up_to_date() {
        let record = parse(
            "= [up to date]      master     -> origin/master",
            FETCH_HEAD_BRANCH,
        )
        .unwrap();
        assert!(record.flags.contains(FetchFlags::HEAD_UPTODATE));
    }

    #[test]
    fn test_rejected_sets_error() {
        let record = parse(
            "! [rejected]        master     -> origin/master  (non-fast-forward)",
            FETCH_HEAD_BRANCH,
        )
        .unwrap();
        assert!(record.flags.contains(FetchFlags::REJECTED));
        assert!(record.flags.contains(FetchFlags::ERROR));
        assert_eq!(record.note, "non-fast-forward");
    }

    #[test]
    fn test_fast_forward_resolves_old_commit() {
        let repo = TestRepo::with_initial_commit();
        let old = repo.head_oid();
        let new = repo.create_commit("second", &[("a.txt", "a")]);
        let line = format!(
            "   {}..{}  master     -> origin/master",
            &old.to_string()[..7],
            &new.to_string()[..7]
        );
        let record = FetchRecord::from_line(&repo.repo(), &line, FETCH_HEAD_BRANCH).unwrap();
        assert!(record.flags.contains(FetchFlags::FAST_FORWARD));
        assert!(!record.flags.contains(FetchFlags::FORCED_UPDATE));
        assert_eq!(record.old_commit.as_deref(), Some(old.to_string().as_str()));
        // The resolved id must denote an existing commit.
        assert!(repo.repo().find_commit(old).is_ok());
    }

    #[test]
    fn test_forced_update_resolves_old_commit() {
        let repo = TestRepo::with_initial_commit();
        let old = repo.head_oid();
        let new = repo.create_commit("second", &[("a.txt", "a")]);
        let line = format!(
            " + {}...{} master     -> origin/master  (forced update)",
            &old.to_string()[..7],
            &new.to_string()[..7]
        );
        let record = FetchRecord::from_line(&repo.repo(), &line, FETCH_HEAD_BRANCH).unwrap();
        assert!(record.flags.contains(FetchFlags::FORCED_UPDATE));
        assert!(!record.flags.contains(FetchFlags::FAST_FORWARD));
        assert_eq!(record.old_commit.as_deref(), Some(old.to_string().as_str()));
        assert_eq!(record.note, "forced update");
    }

    #[test]
    fn test_deleted_line_is_unclassifiable() {
        // Prune reports have no FETCH_HEAD counterpart and no status we
        // track; the orchestrator skips them.
        let res = parse(
            " - [deleted]         (none)     -> origin/experiment",
            FETCH_HEAD_BRANCH,
        );
        assert!(matches!(res, Err(RemoraError::Parse(_))));
    }

    #[test]
    fn test_custom_refspec_reports_remote_path() {
        let fetch_line =
            "c437ee5deb8d00cf02f03720693e4c802e99f390\tnot-for-merge\t'refs/pull/1/head' of /tmp/origin";
        let record = parse(
            "* [new ref]         refs/pull/1/head -> pull/1/head",
            fetch_line,
        )
        .unwrap();
        assert_eq!(record.remote_ref_path, "refs/pull/1/head");
        let local = record.local_ref.unwrap();
        assert_eq!(local.kind, RefKind::Head);
        assert_eq!(local.path, "refs/heads/pull/1/head");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = parse(
            "* [new branch]      master     -> origin/master",
            FETCH_HEAD_BRANCH,
        )
        .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["remoteRefPath"], "master");
        assert_eq!(json["localRef"]["kind"], "remoteTracking");
        assert_eq!(json["localRef"]["path"], "refs/remotes/origin/master");
        assert_eq!(json["flags"], "NEW_HEAD");
    }

    #[test]
    fn test_results_lookup_by_name() {
        let mut results = FetchResults::default();
        let record = parse(
            "* [new branch]      master     -> origin/master",
            FETCH_HEAD_BRANCH,
        )
        .unwrap();
        results.push(record);
        assert_eq!(results.len(), 1);
        assert!(results.get("origin/master").is_some());
        assert!(results.get("origin/other").is_none());
    }
}
