use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the branch searched when a revision specifier is empty.
pub const DEFAULT_BRANCH: &str = "HEAD";

pub type RepoId = u32;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
}

impl Repo {
    pub fn new(id: RepoId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A resolved, absolute commit hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One revision requested for a repository.
///
/// Exactly one of the three fields is meaningful. An all-empty specifier means the default
/// branch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionSpecifier {
    /// A symbolic name (`main`), an absolute or abbreviated commit, or empty for the default
    /// branch.
    #[serde(default)]
    pub rev_spec: String,
    /// Matches every ref whose name matches the glob (`refs/heads/*`).
    #[serde(default)]
    pub ref_glob: String,
    /// Removes refs matching the glob from the set selected by `ref_glob` specifiers.
    #[serde(default)]
    pub exclude_ref_glob: String,
}

impl RevisionSpecifier {
    pub fn rev(rev_spec: impl Into<String>) -> Self {
        Self {
            rev_spec: rev_spec.into(),
            ..Default::default()
        }
    }

    pub fn default_branch() -> Self {
        Self::default()
    }

    pub fn is_glob(&self) -> bool {
        !self.ref_glob.is_empty() || !self.exclude_ref_glob.is_empty()
    }

    /// The branch name this specifier refers to when looked up in an index catalog.
    pub fn branch_name(&self) -> &str {
        if self.rev_spec.is_empty() {
            DEFAULT_BRANCH
        } else {
            &self.rev_spec
        }
    }
}

impl fmt::Display for RevisionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ref_glob.is_empty() {
            write!(f, "*{}", self.ref_glob)
        } else if !self.exclude_ref_glob.is_empty() {
            write!(f, "*!{}", self.exclude_ref_glob)
        } else {
            f.write_str(&self.rev_spec)
        }
    }
}

/// A repository together with the ordered list of revisions to search in it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRevisions {
    pub repo: Repo,
    pub revs: Vec<RevisionSpecifier>,
}

impl RepositoryRevisions {
    pub fn new(repo: Repo, revs: Vec<RevisionSpecifier>) -> Self {
        Self { repo, revs }
    }

    /// A repository searched only at its default branch.
    pub fn default_branch(repo: Repo) -> Self {
        Self {
            repo,
            revs: vec![RevisionSpecifier::default_branch()],
        }
    }

    pub fn has_globs(&self) -> bool {
        self.revs.iter().any(RevisionSpecifier::is_glob)
    }

    /// True when the only requested revision is the default branch.
    pub fn only_default_branch(&self) -> bool {
        self.revs.is_empty() || (self.revs.len() == 1 && self.revs[0].rev_spec.is_empty())
    }

    pub fn rev_specs(&self) -> impl Iterator<Item = &str> {
        self.revs
            .iter()
            .filter(|rev| !rev.is_glob())
            .map(|rev| rev.rev_spec.as_str())
    }
}

impl fmt::Display for RepositoryRevisions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repo.name)?;
        if self.only_default_branch() {
            return Ok(());
        }
        f.write_str("@")?;
        for (idx, rev) in self.revs.iter().enumerate() {
            if idx > 0 {
                f.write_str(":")?;
            }
            write!(f, "{rev}")?;
        }
        Ok(())
    }
}

/// Splits `name@rev1:rev2` into a repository name and its revision specifiers.
///
/// `*glob` selects a ref glob and `*!glob` an excluded ref glob. Empty segments are skipped and a
/// spec without any revision yields a single default-branch specifier.
pub fn parse_repository_revisions(spec: &str) -> (String, Vec<RevisionSpecifier>) {
    let Some((name, revs)) = spec.split_once('@') else {
        return (spec.to_owned(), vec![RevisionSpecifier::default_branch()]);
    };

    let mut out = Vec::new();
    for part in revs.split(':').filter(|part| !part.is_empty()) {
        let rev = if let Some(glob) = part.strip_prefix("*!") {
            RevisionSpecifier {
                exclude_ref_glob: glob.to_owned(),
                ..Default::default()
            }
        } else if let Some(glob) = part.strip_prefix('*') {
            RevisionSpecifier {
                ref_glob: glob.to_owned(),
                ..Default::default()
            }
        } else {
            RevisionSpecifier::rev(part)
        };
        out.push(rev);
    }
    if out.is_empty() {
        out.push(RevisionSpecifier::default_branch());
    }
    (name.to_owned(), out)
}
