use std::time::Duration;

use async_trait::async_trait;
use trawl_core::{Error, RepoId};
use trawl_proto::FileMatch;

use crate::catalog::IndexCatalog;
use crate::query::Q;

/// A batch of matches from one indexed repository branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedMatches {
    pub repo_id: RepoId,
    pub branch: String,
    pub matches: Vec<FileMatch>,
}

#[derive(Clone, Debug, Default)]
pub struct IndexSearchOptions {
    /// Stop after this many matches. Zero means no limit.
    pub max_matches: usize,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSearchStats {
    pub limit_hit: bool,
    /// The backend gave up before visiting every shard.
    pub timed_out: bool,
}

/// The index backend.
///
/// Implementations must be safe to call concurrently; trawl issues at most one `search` per query.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn list_indexed_repos(&self) -> Result<IndexCatalog, Error>;

    /// Runs `query`, streaming matches into `on_matches` as they are found.
    async fn search(
        &self,
        query: &Q,
        options: &IndexSearchOptions,
        on_matches: &(dyn Fn(IndexedMatches) + Send + Sync),
    ) -> Result<IndexSearchStats, Error>;
}
