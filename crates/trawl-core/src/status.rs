use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{ErrorKind, RepoUnavailableReason};
use crate::repo::RepoId;

/// Bit set describing what happened to one repository during a search.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RepoStatus(u8);

impl RepoStatus {
    pub const EMPTY: RepoStatus = RepoStatus(0);
    pub const SEARCHED: RepoStatus = RepoStatus(1 << 0);
    pub const INDEXED: RepoStatus = RepoStatus(1 << 1);
    pub const LIMIT_HIT: RepoStatus = RepoStatus(1 << 2);
    pub const MISSING: RepoStatus = RepoStatus(1 << 3);
    pub const CLONING: RepoStatus = RepoStatus(1 << 4);
    pub const TIMED_OUT: RepoStatus = RepoStatus(1 << 5);
    pub const UNAUTHORIZED: RepoStatus = RepoStatus(1 << 6);

    const NAMES: [(RepoStatus, &'static str); 7] = [
        (RepoStatus::SEARCHED, "searched"),
        (RepoStatus::INDEXED, "indexed"),
        (RepoStatus::LIMIT_HIT, "limit-hit"),
        (RepoStatus::MISSING, "missing"),
        (RepoStatus::CLONING, "cloning"),
        (RepoStatus::TIMED_OUT, "timed-out"),
        (RepoStatus::UNAUTHORIZED, "unauthorized"),
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: RepoStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// The status recorded for a repository whose search ended with an error of `kind`, or
    /// `None` when the error is not a per-repository outcome.
    pub fn from_error_kind(kind: ErrorKind) -> Option<RepoStatus> {
        match kind {
            ErrorKind::RepoUnavailable(RepoUnavailableReason::Missing) => Some(RepoStatus::MISSING),
            ErrorKind::RepoUnavailable(RepoUnavailableReason::Cloning) => Some(RepoStatus::CLONING),
            ErrorKind::RepoUnavailable(RepoUnavailableReason::Unauthorized) => {
                Some(RepoStatus::UNAUTHORIZED)
            }
            ErrorKind::Timeout | ErrorKind::Transient => Some(RepoStatus::TIMED_OUT),
            _ => None,
        }
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

impl BitOr for RepoStatus {
    type Output = RepoStatus;

    fn bitor(self, rhs: RepoStatus) -> RepoStatus {
        RepoStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for RepoStatus {
    fn bitor_assign(&mut self, rhs: RepoStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoStatus({self})")
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty");
        }
        for (idx, name) in self.names().enumerate() {
            if idx > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Accumulated per-repository status for one query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoStatusMap {
    statuses: HashMap<RepoId, RepoStatus>,
}

impl RepoStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// ORs `status` into the entry for `repo`.
    pub fn update(&mut self, repo: RepoId, status: RepoStatus) {
        *self.statuses.entry(repo).or_default() |= status;
    }

    pub fn merge(&mut self, other: &RepoStatusMap) {
        for (repo, status) in &other.statuses {
            self.update(*repo, *status);
        }
    }

    pub fn get(&self, repo: RepoId) -> RepoStatus {
        self.statuses.get(&repo).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RepoId, RepoStatus)> + '_ {
        self.statuses.iter().map(|(repo, status)| (*repo, *status))
    }

    /// Repositories whose status contains every bit of `status`.
    pub fn filter(&self, status: RepoStatus) -> Vec<RepoId> {
        let mut out: Vec<_> = self
            .iter()
            .filter(|(_, s)| s.contains(status))
            .map(|(repo, _)| repo)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}
