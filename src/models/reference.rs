//! Reference models
//!
//! Git reports refs in its fetch/push summaries by short name, by
//! remote-qualified name or by full path. [`GitRef`] is the typed result: a
//! full ref path tagged with the kind of reference it denotes. A produced
//! ref may not exist locally (yet); validity is checked against a repository
//! on demand.

use serde::{Deserialize, Serialize};

use crate::error::{RemoraError, Result};

/// What kind of reference a path denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefKind {
    /// A symbolic ref such as `FETCH_HEAD`.
    Symbolic,
    /// A ref outside the conventional namespaces, used verbatim.
    Plain,
    /// A local branch under `refs/heads/`.
    Head,
    /// A tag under `refs/tags/` (or a tag fetched to a custom path).
    Tag,
    /// A remote-tracking ref under `refs/remotes/`.
    RemoteTracking,
}

/// A typed reference path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    pub kind: RefKind,
    /// Full path, e.g. `refs/remotes/origin/master`.
    pub path: String,
}

impl GitRef {
    pub fn symbolic(name: &str) -> Self {
        Self {
            kind: RefKind::Symbolic,
            path: name.to_string(),
        }
    }

    pub fn head(name: &str) -> Self {
        Self {
            kind: RefKind::Head,
            path: format!("refs/heads/{name}"),
        }
    }

    pub fn tag(name: &str) -> Self {
        Self {
            kind: RefKind::Tag,
            path: format!("refs/tags/{name}"),
        }
    }

    pub fn remote_tracking(remote: &str, name: &str) -> Self {
        Self {
            kind: RefKind::RemoteTracking,
            path: format!("refs/remotes/{remote}/{name}"),
        }
    }

    /// Classify a full ref path by its namespace.
    pub fn from_path(path: &str) -> Self {
        let kind = if path.starts_with("refs/heads/") {
            RefKind::Head
        } else if path.starts_with("refs/tags/") {
            RefKind::Tag
        } else if path.starts_with("refs/remotes/") {
            RefKind::RemoteTracking
        } else if path.starts_with("refs/") {
            RefKind::Plain
        } else {
            RefKind::Symbolic
        };
        Self {
            kind,
            path: path.to_string(),
        }
    }

    /// The display name: the path minus its namespace prefix.
    ///
    /// Remote-tracking refs keep their remote qualifier, e.g.
    /// `origin/master`.
    pub fn name(&self) -> &str {
        let prefix = match self.kind {
            RefKind::Symbolic => return &self.path,
            RefKind::Head => "refs/heads/",
            RefKind::Tag => "refs/tags/",
            RefKind::RemoteTracking => "refs/remotes/",
            RefKind::Plain => "refs/",
        };
        self.path.strip_prefix(prefix).unwrap_or(&self.path)
    }

    /// The remote a remote-tracking ref belongs to.
    pub fn remote_name(&self) -> Option<&str> {
        match self.kind {
            RefKind::RemoteTracking => self.name().split('/').next(),
            _ => None,
        }
    }

    /// Whether the reference exists in the given repository.
    pub fn is_valid(&self, repo: &git2::Repository) -> bool {
        repo.find_reference(&self.path).is_ok()
    }

    /// The commit the reference points at.
    pub fn commit(&self, repo: &git2::Repository) -> Result<git2::Oid> {
        let reference = repo.find_reference(&self.path)?;
        Ok(reference.peel_to_commit()?.id())
    }
}

impl std::fmt::Display for GitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve the local-side ref name reported on a fetch summary line.
///
/// `ref_type_token` is the first word of the matching FETCH_HEAD entry
/// (`branch`, `tag`, `remote-tracking`, or the quoted ref of a custom
/// refspec). The rules apply in priority order and are deterministic:
///
/// 1. `FETCH_HEAD` stays symbolic (fetch without a tracking target);
/// 2. names already under `refs/` are used verbatim, downgraded to
///    [`RefKind::Plain`] unless they denote a tag or live under
///    `refs/remotes/`;
/// 3. tags qualified as `<remote>/tags/<name>` land under
///    `refs/remotes/<remote>/tags/<name>`;
/// 4. other tags land under `refs/tags/`;
/// 5. branches land under `refs/remotes/` (remote-tracking);
/// 6. custom refspec targets (type token contains `/`) land under
///    `refs/heads/`.
pub(crate) fn resolve_fetch_ref(
    reported: &str,
    ref_type_token: &str,
    is_tag_operation: bool,
) -> Result<GitRef> {
    let reported = reported.trim();
    if reported == "FETCH_HEAD" {
        return Ok(GitRef::symbolic("FETCH_HEAD"));
    }

    let mut kind = if ref_type_token == "tag" || is_tag_operation {
        RefKind::Tag
    } else if matches!(ref_type_token, "remote-tracking" | "branch") {
        RefKind::RemoteTracking
    } else if ref_type_token.contains('/') {
        RefKind::Head
    } else {
        return Err(RemoraError::Parse(format!(
            "cannot handle reference type `{ref_type_token}`"
        )));
    };

    let path = if reported.starts_with("refs/") {
        // An explicit full path overrides default qualification. Anything
        // outside refs/remotes loses its remote-tracking nature, while tags
        // stay tags wherever they were fetched to.
        if kind != RefKind::Tag && !reported.starts_with("refs/remotes/") {
            kind = RefKind::Plain;
        } else if kind != RefKind::Tag {
            kind = RefKind::RemoteTracking;
        }
        reported.to_string()
    } else if kind == RefKind::Tag && reported.contains("tags/") {
        // A tag fetched into a remote-tracking namespace.
        format!("refs/remotes/{reported}")
    } else {
        let prefix = match kind {
            RefKind::Tag => "refs/tags",
            RefKind::RemoteTracking => "refs/remotes",
            _ => "refs/heads",
        };
        format!("{prefix}/{reported}")
    };

    Ok(GitRef { kind, path })
}
