use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trawl_core::{Error, RepoId, RepositoryRevisions, RevisionSpecifier, DEFAULT_BRANCH};
use trawl_scheduler::RequestContext;

use crate::backend::IndexBackend;
use crate::catalog::IndexCatalog;

/// Whether the index may, must or must not be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Use the index where possible and search everything else remotely.
    #[default]
    Yes,
    /// Only search the index; anything not indexed is reported missing.
    Only,
    /// Never use the index.
    No,
}

impl FromStr for IndexMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" => Ok(IndexMode::Yes),
            "only" => Ok(IndexMode::Only),
            "no" | "n" | "false" => Ok(IndexMode::No),
            other => Err(Error::config(format!("invalid index mode {other:?}"))),
        }
    }
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexMode::Yes => "yes",
            IndexMode::Only => "only",
            IndexMode::No => "no",
        })
    }
}

#[derive(Clone, Debug)]
pub struct PartitionOptions {
    pub mode: IndexMode,
    /// Only treat repositories whose index carries symbols as indexed.
    pub require_symbols: bool,
    pub catalog_timeout: Duration,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            mode: IndexMode::Yes,
            require_symbols: false,
            catalog_timeout: Duration::from_secs(1),
        }
    }
}

/// The revisions that can be answered from the index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexedRepoRevs {
    repo_revs: BTreeMap<RepoId, RepositoryRevisions>,
    repo_branches: BTreeMap<String, BTreeSet<RepoId>>,
}

impl IndexedRepoRevs {
    fn add(&mut self, repo: &RepositoryRevisions, rev: RevisionSpecifier, branch: &str) {
        self.repo_revs
            .entry(repo.repo.id)
            .or_insert_with(|| RepositoryRevisions::new(repo.repo.clone(), Vec::new()))
            .revs
            .push(rev);
        self.repo_branches
            .entry(branch.to_owned())
            .or_default()
            .insert(repo.repo.id);
    }

    pub fn get(&self, id: RepoId) -> Option<&RepositoryRevisions> {
        self.repo_revs.get(&id)
    }

    pub fn repo_revs(&self) -> impl Iterator<Item = &RepositoryRevisions> {
        self.repo_revs.values()
    }

    /// Branch name to the repositories indexed at that branch.
    pub fn repo_branches(&self) -> &BTreeMap<String, BTreeSet<RepoId>> {
        &self.repo_branches
    }

    pub fn len(&self) -> usize {
        self.repo_revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo_revs.is_empty()
    }
}

/// The outcome of splitting repository revisions between the index and remote search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub indexed: IndexedRepoRevs,
    pub unindexed: Vec<RepositoryRevisions>,
    /// Revisions that were neither indexed nor searchable under [`IndexMode::Only`].
    pub missing: Vec<RepositoryRevisions>,
    /// The catalog could not be listed, so nothing was classified as indexed.
    pub index_unavailable: bool,
}

/// Splits `repos` against an already-listed catalog.
///
/// Every input `(repository, revision)` lands in exactly one of `indexed`, `unindexed` or
/// `missing`.
pub fn partition_with_catalog(
    repos: Vec<RepositoryRevisions>,
    catalog: &IndexCatalog,
    options: &PartitionOptions,
) -> Partition {
    let mut out = Partition::default();
    if options.mode == IndexMode::No {
        out.unindexed = repos;
        return out;
    }

    for repo in repos {
        let indexed_repo = catalog
            .get(repo.repo.id)
            .filter(|indexed| !options.require_symbols || indexed.has_symbols);

        // Ref globs are resolved remotely, so the whole repository goes there.
        let Some(indexed_repo) = indexed_repo.filter(|_| !repo.has_globs()) else {
            if options.mode == IndexMode::Only && !repo.has_globs() {
                out.missing.push(repo);
            } else {
                out.unindexed.push(repo);
            }
            continue;
        };

        let mut unindexed = Vec::new();
        let revs = if repo.revs.is_empty() {
            vec![RevisionSpecifier::default_branch()]
        } else {
            repo.revs.clone()
        };
        for rev in revs {
            let rev_spec = if rev.rev_spec.is_empty() {
                DEFAULT_BRANCH
            } else {
                rev.rev_spec.as_str()
            };
            match indexed_repo.branch_for(rev_spec) {
                Some(branch) => {
                    let branch = branch.name.clone();
                    out.indexed.add(&repo, rev, &branch);
                }
                None => unindexed.push(rev),
            }
        }

        if !unindexed.is_empty() {
            let rest = RepositoryRevisions::new(repo.repo.clone(), unindexed);
            if options.mode == IndexMode::Only {
                out.missing.push(rest);
            } else {
                out.unindexed.push(rest);
            }
        }
    }
    out
}

/// Lists the index catalog and partitions repository revisions against it.
#[derive(Clone)]
pub struct RepoPartitioner {
    backend: Arc<dyn IndexBackend>,
    options: PartitionOptions,
}

impl RepoPartitioner {
    pub fn new(backend: Arc<dyn IndexBackend>, options: PartitionOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    /// Partitions `repos`.
    ///
    /// If the catalog cannot be listed within the catalog timeout, [`IndexMode::Only`] fails;
    /// otherwise everything is searched remotely and the result is flagged `index_unavailable`.
    pub async fn partition(
        &self,
        ctx: &RequestContext,
        repos: Vec<RepositoryRevisions>,
    ) -> Result<Partition, Error> {
        if self.options.mode == IndexMode::No || repos.is_empty() {
            return Ok(partition_with_catalog(repos, &IndexCatalog::new(), &PartitionOptions {
                mode: IndexMode::No,
                ..self.options.clone()
            }));
        }

        match self.list_catalog(ctx).await {
            Ok(catalog) => Ok(partition_with_catalog(repos, &catalog, &self.options)),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) if self.options.mode == IndexMode::Only => {
                Err(err.context("index unavailable for index-only search"))
            }
            Err(err) => {
                tracing::warn!(
                    target: "trawl.index",
                    error = %err,
                    repos = repos.len(),
                    "index catalog unavailable; searching all repositories unindexed"
                );
                Ok(Partition {
                    unindexed: repos,
                    index_unavailable: true,
                    ..Partition::default()
                })
            }
        }
    }

    async fn list_catalog(&self, ctx: &RequestContext) -> Result<IndexCatalog, Error> {
        let timeout = self.options.catalog_timeout;
        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(Error::cancelled()),
            listed = tokio::time::timeout(timeout, self.backend.list_indexed_repos()) => {
                listed.map_err(|_| {
                    Error::timeout(format!(
                        "listing indexed repositories took longer than {timeout:?}"
                    ))
                })?
            }
        }
    }
}
