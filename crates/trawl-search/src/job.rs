use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::Instrument;
use trawl_config::SearchConfig;
use trawl_core::{Error, ErrorKind, Repo, RepoId, RepoStatus, RepoStatusMap, RepositoryRevisions};
use trawl_index::{
    partition_with_catalog, IndexBackend, IndexCatalog, IndexMode, IndexSearchOptions,
    IndexedMatches, IndexedRepoRevs, Partition, PartitionOptions, QueryCompiler, RepoPartitioner, Q,
};
use trawl_proto::{FileMatch, PatternInfo};
use trawl_scheduler::{CancellationToken, RequestContext, TaskError, TaskGroup};

use crate::dispatch::{DispatchClient, RevisionSearch};
use crate::sink::{AggregationSink, RepoMatches, SearchEvent};

/// One logical search over many repositories.
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    pub repos: Vec<RepositoryRevisions>,
    pub pattern: PatternInfo,
    pub index_mode: IndexMode,
    /// Only treat repositories whose index carries symbols as indexed.
    pub require_symbols: bool,
    /// The caller asked for a timeout, so every fetch may use the rest of the deadline.
    pub explicit_timeout: bool,
}

/// Summary of a finished search. Matches went to the sink as they were found.
#[derive(Clone, Debug, Default)]
pub struct SearchStats {
    pub status: RepoStatusMap,
    /// The match limit stopped the search early.
    pub limit_hit: bool,
    /// The index catalog could not be listed and everything was searched remotely.
    pub index_unavailable: bool,
    /// Per-repository failures that did not stop the search.
    pub repo_errors: Vec<Error>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearcherOptions {
    pub index_enabled: bool,
    pub many_repos_fetch_timeout: Duration,
    pub default_fetch_timeout: Duration,
    pub catalog_timeout: Duration,
}

impl Default for SearcherOptions {
    fn default() -> Self {
        (&SearchConfig::default()).into()
    }
}

impl From<&SearchConfig> for SearcherOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            index_enabled: config.index_enabled,
            many_repos_fetch_timeout: config.many_repos_fetch_timeout(),
            default_fetch_timeout: config.default_fetch_timeout(),
            catalog_timeout: config.catalog_timeout(),
        }
    }
}

/// Runs queries: indexed revisions go to the index backend as one compiled query, everything else
/// fans out through the [`DispatchClient`].
pub struct Searcher {
    dispatch: Arc<DispatchClient>,
    index: Option<Arc<dyn IndexBackend>>,
    compiler: QueryCompiler,
    options: SearcherOptions,
}

impl Searcher {
    pub fn new(
        dispatch: Arc<DispatchClient>,
        index: Option<Arc<dyn IndexBackend>>,
        options: SearcherOptions,
    ) -> Self {
        Self {
            dispatch,
            index,
            compiler: QueryCompiler::new(),
            options,
        }
    }

    pub fn dispatch(&self) -> &Arc<DispatchClient> {
        &self.dispatch
    }

    /// The fetch timeout given to each searcher request.
    ///
    /// A single repository, or a caller-chosen timeout, gets whatever remains of the deadline.
    /// Wide fan-outs cap each fetch so one slow repository cannot hold up the rest.
    pub fn fetch_timeout(
        &self,
        ctx: &RequestContext,
        repo_count: usize,
        explicit: bool,
    ) -> Duration {
        match ctx.remaining() {
            Some(remaining) if explicit || repo_count == 1 => remaining,
            Some(remaining) => remaining.min(self.options.many_repos_fetch_timeout),
            None => self.options.default_fetch_timeout,
        }
    }

    /// Runs `query`, streaming matches and statuses into `sink`.
    ///
    /// Fails as a whole only when there is nothing to route to, the query is cancelled, an
    /// index-only search cannot use the index, or a repository fails in a way that invalidates
    /// the query (a bad pattern, an unknown explicit revision). Everything else is reported per
    /// repository.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        query: SearchQuery,
        sink: Arc<dyn AggregationSink>,
    ) -> Result<SearchStats, Error> {
        let span = tracing::info_span!(
            target: "trawl.search",
            "search",
            request_id = ctx.request_id(),
            repos = query.repos.len(),
            mode = %query.index_mode,
        );
        async move {
            let result = self.search_inner(ctx, query, sink).await;
            match &result {
                Ok(stats) => tracing::info!(
                    target: "trawl.search",
                    repos = stats.status.len(),
                    limit_hit = stats.limit_hit,
                    repo_errors = stats.repo_errors.len(),
                    "search finished"
                ),
                Err(err) => tracing::warn!(target: "trawl.search", error = %err, "search failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn search_inner(
        &self,
        ctx: &RequestContext,
        query: SearchQuery,
        sink: Arc<dyn AggregationSink>,
    ) -> Result<SearchStats, Error> {
        ctx.check()?;
        let partition = self.partition(ctx, &query).await?;

        let mut stats = SearchStats {
            index_unavailable: partition.index_unavailable,
            ..SearchStats::default()
        };
        for missing in &partition.missing {
            stats.status.update(missing.repo.id, RepoStatus::MISSING);
            sink.send(SearchEvent::status(missing.repo.id, RepoStatus::MISSING));
        }

        let scope = ctx.child();
        let budget = Arc::new(MatchBudget::new(query.pattern.limit, scope.token().clone()));
        let pattern = Arc::new(query.pattern);
        let fetch_timeout =
            self.fetch_timeout(ctx, partition.unindexed.len(), query.explicit_timeout);

        let (indexed, unindexed) = tokio::try_join!(
            self.search_indexed(&scope, &partition.indexed, &pattern, &budget, &sink),
            self.search_unindexed(
                &scope,
                partition.unindexed,
                &pattern,
                fetch_timeout,
                &budget,
                &sink
            ),
        )?;
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }

        for outcome in [indexed, unindexed] {
            stats.status.merge(&outcome.status);
            stats.limit_hit |= outcome.limit_hit;
            stats.repo_errors.extend(outcome.repo_errors);
        }
        stats.limit_hit |= budget.hit();
        Ok(stats)
    }

    async fn partition(
        &self,
        ctx: &RequestContext,
        query: &SearchQuery,
    ) -> Result<Partition, Error> {
        let mode = match (self.options.index_enabled, query.index_mode) {
            (false, IndexMode::Only) => {
                return Err(Error::config("index-only search requested but the index is disabled"))
            }
            (false, _) => IndexMode::No,
            (true, mode) => mode,
        };
        // The index cannot evaluate structural patterns; only searchers can.
        let mode = match (query.pattern.is_structural, mode) {
            (true, IndexMode::Only) => {
                return Err(Error::config("structural patterns cannot be searched index-only"))
            }
            (true, _) => IndexMode::No,
            (false, mode) => mode,
        };
        let options = PartitionOptions {
            mode,
            require_symbols: query.require_symbols,
            catalog_timeout: self.options.catalog_timeout,
        };

        match &self.index {
            Some(backend) => {
                RepoPartitioner::new(Arc::clone(backend), options)
                    .partition(ctx, query.repos.clone())
                    .await
            }
            None if mode == IndexMode::Only => Err(Error::config(
                "index-only search requested but no index backend is configured",
            )),
            None => Ok(partition_with_catalog(
                query.repos.clone(),
                &IndexCatalog::new(),
                &PartitionOptions {
                    mode: IndexMode::No,
                    ..options
                },
            )),
        }
    }

    async fn search_indexed(
        &self,
        scope: &RequestContext,
        indexed: &IndexedRepoRevs,
        pattern: &PatternInfo,
        budget: &MatchBudget,
        sink: &Arc<dyn AggregationSink>,
    ) -> Result<Outcome, Error> {
        let mut outcome = Outcome::default();
        let Some(backend) = self.index.as_deref() else {
            return Ok(outcome);
        };
        if indexed.is_empty() {
            return Ok(outcome);
        }

        let mut searched: BTreeSet<RepoId> = indexed.repo_revs().map(|rr| rr.repo.id).collect();
        if pattern.has_repo_file_filters() {
            let allowed = self
                .indexed_repos_with_files(scope, backend, indexed, pattern)
                .await?;
            // Repositories without the required files are searched, with nothing found.
            for id in searched.difference(&allowed) {
                outcome.status.update(*id, RepoStatus::SEARCHED | RepoStatus::INDEXED);
            }
            searched = allowed;
        }

        if !searched.is_empty() {
            let branches: BTreeMap<String, BTreeSet<RepoId>> = indexed
                .repo_branches()
                .iter()
                .map(|(branch, ids)| {
                    let ids: BTreeSet<RepoId> = ids.intersection(&searched).copied().collect();
                    (branch.clone(), ids)
                })
                .filter(|(_, ids)| !ids.is_empty())
                .collect();
            let q = Q::and(vec![Q::RepoBranches(branches), self.compiler.compile(pattern)?])
                .simplify();
            tracing::debug!(
                target: "trawl.search",
                query = %q,
                repos = searched.len(),
                "searching index"
            );

            let names: HashMap<RepoId, &str> = indexed
                .repo_revs()
                .map(|rr| (rr.repo.id, rr.repo.name.as_str()))
                .collect();
            let on_matches = |batch: IndexedMatches| {
                let matches = budget.take(batch.matches);
                if matches.is_empty() {
                    return;
                }
                sink.send(SearchEvent::matches(RepoMatches {
                    repo_id: batch.repo_id,
                    repo: names
                        .get(&batch.repo_id)
                        .map(|name| name.to_string())
                        .unwrap_or_default(),
                    rev: batch.branch,
                    matches,
                }));
            };
            let options = IndexSearchOptions {
                max_matches: pattern.limit,
                timeout: scope.remaining(),
            };

            let result = tokio::select! {
                biased;
                _ = scope.token().cancelled() => Err(Error::cancelled()),
                result = backend.search(&q, &options, &on_matches) => result,
            };

            let mut status = RepoStatus::SEARCHED | RepoStatus::INDEXED;
            match result {
                Ok(index_stats) => {
                    outcome.limit_hit = index_stats.limit_hit;
                    if index_stats.timed_out {
                        status |= RepoStatus::TIMED_OUT;
                    }
                }
                Err(err) if err.is_cancelled() && budget.hit() => outcome.limit_hit = true,
                Err(err) if err.kind() == ErrorKind::Timeout => {
                    tracing::warn!(
                        target: "trawl.search",
                        error = %err,
                        "indexed search timed out"
                    );
                    status = RepoStatus::INDEXED | RepoStatus::TIMED_OUT;
                }
                Err(err) => return Err(err.context("indexed search")),
            }
            for id in &searched {
                outcome.status.update(*id, status);
            }
        }

        if !outcome.status.is_empty() {
            sink.send(SearchEvent {
                matches: Vec::new(),
                status: outcome.status.clone(),
            });
        }
        Ok(outcome)
    }

    /// The indexed repositories that contain every must-include file and no must-exclude file.
    async fn indexed_repos_with_files(
        &self,
        scope: &RequestContext,
        backend: &dyn IndexBackend,
        indexed: &IndexedRepoRevs,
        pattern: &PatternInfo,
    ) -> Result<BTreeSet<RepoId>, Error> {
        let case = pattern.path_patterns_are_case_sensitive;
        let restrict = self.compiler.repo_branches_query(indexed);
        let mut allowed: BTreeSet<RepoId> = indexed.repo_revs().map(|rr| rr.repo.id).collect();

        let includes = self
            .compiler
            .file_only_queries(&pattern.file_patterns_repos_must_include, case)?;
        for q in includes {
            let q = Q::and(vec![restrict.clone(), q]).simplify();
            let found = repos_matching(scope, backend, &q).await?;
            allowed.retain(|id| found.contains(id));
        }

        let excludes = self
            .compiler
            .file_only_queries(&pattern.file_patterns_repos_must_exclude, case)?;
        for q in excludes {
            let q = Q::and(vec![restrict.clone(), q]).simplify();
            let found = repos_matching(scope, backend, &q).await?;
            allowed.retain(|id| !found.contains(id));
        }
        Ok(allowed)
    }

    async fn search_unindexed(
        &self,
        scope: &RequestContext,
        repos: Vec<RepositoryRevisions>,
        pattern: &Arc<PatternInfo>,
        fetch_timeout: Duration,
        budget: &Arc<MatchBudget>,
        sink: &Arc<dyn AggregationSink>,
    ) -> Result<Outcome, Error> {
        let mut outcome = Outcome::default();
        if repos.is_empty() {
            return Ok(outcome);
        }
        self.dispatch.refresh_limit().await?;

        let mut group = TaskGroup::new(scope.token());
        for repo_revs in repos {
            let expanded = tokio::select! {
                biased;
                _ = scope.token().cancelled() => Err(Error::cancelled()),
                revs = self.dispatch.resolver().expand_revisions(&repo_revs) => revs,
            };
            let revs = match expanded {
                Ok(revs) => revs,
                // The match limit was reached or the query was cancelled; the caller sorts it out.
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    let repo = repo_revs.repo;
                    let done = classify("", Err(err.with_repo(repo.name.clone())))?;
                    outcome.record(repo.id, done, sink.as_ref());
                    continue;
                }
            };
            if revs.is_empty() {
                // Only ref globs that matched nothing.
                outcome.record(repo_revs.repo.id, (RepoStatus::SEARCHED, None), sink.as_ref());
                continue;
            }

            for rev in revs {
                let task = RevisionTask {
                    ctx: scope.clone(),
                    dispatch: Arc::clone(&self.dispatch),
                    repo: repo_revs.repo.clone(),
                    rev,
                    pattern: Arc::clone(pattern),
                    fetch_timeout,
                    budget: Arc::clone(budget),
                    sink: Arc::clone(sink),
                };
                group.spawn(move |token| task.run(token));
            }
        }

        let mut fatal = None;
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok(done) => outcome.record(done.repo_id, (done.status, done.error), sink.as_ref()),
                // A sibling failed, the match limit was reached or the query was cancelled.
                Err(TaskError::Cancelled) => {}
                Err(err) => {
                    if fatal.is_none() {
                        fatal = Some(Error::from(err));
                    }
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}

/// Results of one side (indexed or unindexed) of a search.
#[derive(Debug, Default)]
struct Outcome {
    status: RepoStatusMap,
    limit_hit: bool,
    repo_errors: Vec<Error>,
}

impl Outcome {
    fn record(
        &mut self,
        repo_id: RepoId,
        (status, error): (RepoStatus, Option<Error>),
        sink: &dyn AggregationSink,
    ) {
        if status.contains(RepoStatus::LIMIT_HIT) {
            self.limit_hit = true;
        }
        if !status.is_empty() {
            self.status.update(repo_id, status);
            sink.send(SearchEvent::status(repo_id, status));
        }
        if let Some(err) = error {
            self.repo_errors.push(err);
        }
    }
}

struct RevisionDone {
    repo_id: RepoId,
    status: RepoStatus,
    error: Option<Error>,
}

/// Everything one spawned revision search owns.
struct RevisionTask {
    ctx: RequestContext,
    dispatch: Arc<DispatchClient>,
    repo: Repo,
    rev: String,
    pattern: Arc<PatternInfo>,
    fetch_timeout: Duration,
    budget: Arc<MatchBudget>,
    sink: Arc<dyn AggregationSink>,
}

impl RevisionTask {
    async fn run(self, token: CancellationToken) -> Result<RevisionDone, Error> {
        let ctx = self.ctx.with_token(token);
        let result = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, self.search(&ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::timeout("query deadline exceeded").with_repo(self.repo.name.clone()))
                }),
            None => self.search(&ctx).await,
        };
        let (status, error) = classify(&self.rev, result)?;
        Ok(RevisionDone {
            repo_id: self.repo.id,
            status,
            error,
        })
    }

    async fn search(&self, ctx: &RequestContext) -> Result<bool, Error> {
        let search = RevisionSearch {
            repo: &self.repo,
            rev: &self.rev,
            pattern: &self.pattern,
            fetch_timeout: self.fetch_timeout,
            indexed: false,
        };
        if self.pattern.has_repo_file_filters()
            && !self
                .dispatch
                .passes_repo_file_filters(ctx, search.clone())
                .await?
        {
            tracing::debug!(
                target: "trawl.search",
                repo = %self.repo,
                "skipped by repository file filters"
            );
            return Ok(false);
        }

        let on_matches = |matches: Vec<FileMatch>| {
            let matches = self.budget.take(matches);
            if matches.is_empty() {
                return;
            }
            self.sink.send(SearchEvent::matches(RepoMatches {
                repo_id: self.repo.id,
                repo: self.repo.name.clone(),
                rev: self.rev.clone(),
                matches,
            }));
        };
        self.dispatch
            .search_repo_revision(ctx, search, &on_matches)
            .await
    }
}

/// Maps the result of one revision search onto a status, a per-repository error, or a failure
/// of the whole query.
fn classify(rev: &str, result: Result<bool, Error>) -> Result<(RepoStatus, Option<Error>), Error> {
    let err = match result {
        Ok(false) => return Ok((RepoStatus::SEARCHED, None)),
        Ok(true) => return Ok((RepoStatus::SEARCHED | RepoStatus::LIMIT_HIT, None)),
        Err(err) => err,
    };
    match err.kind() {
        // The default branch of an empty repository does not resolve.
        ErrorKind::RevisionNotFound if rev.is_empty() => Ok((RepoStatus::SEARCHED, None)),
        ErrorKind::Protocol => {
            tracing::warn!(
                target: "trawl.search",
                error = %err,
                repo = ?err.repo(),
                "repository search failed"
            );
            Ok((RepoStatus::EMPTY, Some(err)))
        }
        kind => match RepoStatus::from_error_kind(kind) {
            Some(status) => {
                tracing::warn!(
                    target: "trawl.search",
                    error = %err,
                    repo = ?err.repo(),
                    %status,
                    "repository not searched"
                );
                Ok((status, None))
            }
            None => Err(err),
        },
    }
}

/// Repositories with at least one match for `q`.
async fn repos_matching(
    scope: &RequestContext,
    backend: &dyn IndexBackend,
    q: &Q,
) -> Result<BTreeSet<RepoId>, Error> {
    let found = Mutex::new(BTreeSet::new());
    let on_matches = |batch: IndexedMatches| {
        if !batch.matches.is_empty() {
            found.lock().insert(batch.repo_id);
        }
    };
    let options = IndexSearchOptions {
        max_matches: 0,
        timeout: scope.remaining(),
    };
    tokio::select! {
        biased;
        _ = scope.token().cancelled() => return Err(Error::cancelled()),
        result = backend.search(q, &options, &on_matches) => { result?; }
    }
    Ok(found.into_inner())
}

/// Query-wide match limit. Reaching it cancels the rest of the search.
struct MatchBudget {
    limit: usize,
    used: Mutex<usize>,
    hit: AtomicBool,
    scope: CancellationToken,
}

impl MatchBudget {
    fn new(limit: usize, scope: CancellationToken) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
            hit: AtomicBool::new(false),
            scope,
        }
    }

    /// Keeps the files of `matches` that fit in the remaining budget.
    fn take(&self, matches: Vec<FileMatch>) -> Vec<FileMatch> {
        if self.limit == 0 {
            return matches;
        }
        let mut used = self.used.lock();
        let mut kept = Vec::with_capacity(matches.len());
        for file in matches {
            if *used >= self.limit {
                break;
            }
            *used += file.match_count();
            kept.push(file);
        }
        if *used >= self.limit && !self.hit.swap(true, Ordering::SeqCst) {
            self.scope.cancel();
        }
        kept
    }

    fn hit(&self) -> bool {
        self.hit.load(Ordering::SeqCst)
    }
}
