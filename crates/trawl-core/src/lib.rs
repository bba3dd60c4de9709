//! Core shared types for trawl.
//!
//! This crate holds the repository/revision model, the per-repository status map and the error
//! taxonomy shared by every other crate. It has no async or network dependencies.

mod error;
mod repo;
mod status;

pub use error::{Error, ErrorKind, RepoUnavailableReason, Result};
pub use repo::{
    parse_repository_revisions, CommitId, Repo, RepoId, RepositoryRevisions, RevisionSpecifier,
    DEFAULT_BRANCH,
};
pub use status::{RepoStatus, RepoStatusMap};
