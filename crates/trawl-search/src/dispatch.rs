use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use trawl_config::SearchConfig;
use trawl_core::{CommitId, Error, Repo, RepositoryRevisions};
use trawl_endpoint::{EndpointMap, ServiceRegistry};
use trawl_proto::{DoneEvent, FileMatch, PatternInfo, SearchRequest};
use trawl_scheduler::{ConcurrencyLimiter, RequestContext};

use crate::transport::Transport;

/// Resolves revision specifiers to commits.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    /// Resolves `rev_spec` (empty for the default branch) in `repo`.
    ///
    /// Must answer from what is already cloned; resolving never triggers a remote fetch. Unknown
    /// revisions fail with `RevisionNotFound`, repositories that are not cloned yet with
    /// `RepoUnavailable`.
    async fn resolve(&self, repo: &Repo, rev_spec: &str) -> Result<CommitId, Error>;

    /// The concrete revisions to search for `repo`, with ref globs expanded.
    ///
    /// The default implementation cannot list refs and returns only the non-glob specifiers.
    async fn expand_revisions(&self, repo: &RepositoryRevisions) -> Result<Vec<String>, Error> {
        Ok(repo.rev_specs().map(str::to_owned).collect())
    }
}

/// Attempts per repository revision. A transient failure moves on to the next candidate.
pub const MAX_ATTEMPTS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOptions {
    /// In-flight requests allowed per searcher replica.
    pub fanout_factor: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { fanout_factor: 32 }
    }
}

impl From<&SearchConfig> for DispatchOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            fanout_factor: config.fanout_factor,
        }
    }
}

/// One repository revision to search remotely.
#[derive(Clone, Debug)]
pub struct RevisionSearch<'a> {
    pub repo: &'a Repo,
    /// Revision specifier; empty for the default branch.
    pub rev: &'a str,
    pub pattern: &'a PatternInfo,
    pub fetch_timeout: Duration,
    /// The revision is also indexed.
    pub indexed: bool,
}

/// Sends per-revision searches to the searcher fleet.
///
/// Requests are routed by `repo@commit` so repeated searches of the same tree hit the same
/// replica, and throttled by a limiter sized to the fleet.
pub struct DispatchClient {
    endpoints: EndpointMap,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn CommitResolver>,
    limiter: ConcurrencyLimiter,
    options: DispatchOptions,
}

impl DispatchClient {
    pub fn new(
        endpoints: EndpointMap,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn CommitResolver>,
        options: DispatchOptions,
    ) -> Self {
        let options = DispatchOptions {
            fanout_factor: options.fanout_factor.max(1),
        };
        Self {
            endpoints,
            transport,
            resolver,
            limiter: ConcurrencyLimiter::new(options.fanout_factor),
            options,
        }
    }

    /// Builds a client for the searchers named by `config.searcher_url`.
    pub fn from_config(
        config: &SearchConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn CommitResolver>,
        registry: Option<Arc<dyn ServiceRegistry>>,
    ) -> Result<Self, Error> {
        let mut endpoints = EndpointMap::from_spec(&config.searcher_url, registry)?;
        if let Some(timeout) = config.discovery_ready_timeout() {
            endpoints = endpoints.with_ready_timeout(timeout);
        }
        Ok(Self::new(endpoints, transport, resolver, config.into()))
    }

    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &Arc<dyn CommitResolver> {
        &self.resolver
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Resizes the limiter to `replicas × fanout_factor` if the fleet changed size.
    pub async fn refresh_limit(&self) -> Result<usize, Error> {
        let ring = self.endpoints.snapshot().await?;
        if ring.is_empty() {
            return Err(Error::empty_routing());
        }
        let limit = ring.len().saturating_mul(self.options.fanout_factor);
        if self.limiter.limit() != limit {
            tracing::debug!(
                target: "trawl.search",
                replicas = ring.len(),
                limit,
                "resizing searcher concurrency limit"
            );
            self.limiter.set_limit(limit);
        }
        Ok(limit)
    }

    /// Searches one revision of one repository, streaming matches into `on_matches`.
    ///
    /// Returns whether the searcher hit its match limit. A transient failure is retried on the
    /// next routing candidate until the attempt budget is spent, unless the failed attempt already
    /// delivered matches. Other failures are returned as-is with the repository attached.
    pub async fn search_repo_revision(
        &self,
        ctx: &RequestContext,
        search: RevisionSearch<'_>,
        on_matches: &(dyn Fn(Vec<FileMatch>) + Send + Sync),
    ) -> Result<bool, Error> {
        let label = if search.rev.is_empty() {
            search.repo.name.clone()
        } else {
            format!("{}@{}", search.repo.name, search.rev)
        };
        self.search_inner(ctx, &search, on_matches)
            .await
            .map_err(|err| err.with_repo(label))
    }

    async fn search_inner(
        &self,
        ctx: &RequestContext,
        search: &RevisionSearch<'_>,
        on_matches: &(dyn Fn(Vec<FileMatch>) + Send + Sync),
    ) -> Result<bool, Error> {
        ctx.check()?;
        self.refresh_limit().await?;
        let _permit = self.limiter.acquire(ctx.token()).await?;

        let commit = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => return Err(Error::cancelled()),
            commit = self.resolver.resolve(search.repo, search.rev) => commit?,
        };

        let key = format!("{}@{}", search.repo.name, commit);
        let candidates = self
            .endpoints
            .get_n(&key, MAX_ATTEMPTS)
            .await?;

        let request = SearchRequest {
            repo: search.repo.name.clone(),
            repo_id: search.repo.id,
            commit_oid: commit.to_string(),
            branch: search.rev.to_owned(),
            indexed: search.indexed,
            fetch_timeout_ms: u64::try_from(search.fetch_timeout.as_millis()).unwrap_or(u64::MAX),
            pattern_info: search.pattern.clone(),
        };

        // Matches already handed on cannot be taken back, so a retry would repeat them.
        let delivered = AtomicBool::new(false);
        let forward = |matches: Vec<FileMatch>| {
            if !matches.is_empty() {
                delivered.store(true, Ordering::Relaxed);
            }
            on_matches(matches);
        };

        let mut attempt = 0usize;
        loop {
            // A single-replica fleet retries on the replica that just failed.
            let endpoint = &candidates[attempt % candidates.len()];
            attempt += 1;
            tracing::debug!(
                target: "trawl.search",
                request_id = ctx.request_id(),
                repo = %search.repo,
                commit = %commit,
                %endpoint,
                attempt,
                "searching repository revision"
            );

            let result = tokio::select! {
                biased;
                _ = ctx.token().cancelled() => return Err(Error::cancelled()),
                result = self.transport.search(endpoint, &request, &forward) => result,
            };

            match result.and_then(done_result) {
                Ok(limit_hit) => return Ok(limit_hit),
                Err(err)
                    if err.is_retryable()
                        && attempt < MAX_ATTEMPTS
                        && !delivered.load(Ordering::Relaxed) =>
                {
                    tracing::debug!(
                        target: "trawl.search",
                        request_id = ctx.request_id(),
                        %endpoint,
                        attempt,
                        error = %err,
                        "retrying on next searcher"
                    );
                }
                Err(err) => return Err(err.context(format!("searcher {endpoint}"))),
            }
        }
    }

    /// Whether `search.repo` contains a file whose path matches `path_pattern`.
    ///
    /// Sends a path-only request limited to one match.
    pub async fn repo_has_file(
        &self,
        ctx: &RequestContext,
        search: RevisionSearch<'_>,
        path_pattern: &str,
    ) -> Result<bool, Error> {
        let probe = PatternInfo {
            pattern: path_pattern.to_owned(),
            is_regexp: true,
            is_case_sensitive: search.pattern.path_patterns_are_case_sensitive,
            pattern_matches_path: true,
            pattern_matches_content: false,
            limit: 1,
            ..PatternInfo::default()
        };
        let found = AtomicBool::new(false);
        let on_matches = |matches: Vec<FileMatch>| {
            if !matches.is_empty() {
                found.store(true, Ordering::Relaxed);
            }
        };
        self.search_repo_revision(
            ctx,
            RevisionSearch {
                pattern: &probe,
                ..search
            },
            &on_matches,
        )
        .await?;
        Ok(found.load(Ordering::Relaxed))
    }

    /// Applies the pattern's must-include and must-exclude file filters to one revision.
    pub async fn passes_repo_file_filters(
        &self,
        ctx: &RequestContext,
        search: RevisionSearch<'_>,
    ) -> Result<bool, Error> {
        for include in &search.pattern.file_patterns_repos_must_include {
            if !self.repo_has_file(ctx, search.clone(), include).await? {
                return Ok(false);
            }
        }
        for exclude in &search.pattern.file_patterns_repos_must_exclude {
            if self.repo_has_file(ctx, search.clone(), exclude).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Interprets the terminal frame: an embedded error fails the attempt and `deadline_hit` turns
/// into a timeout once the partial matches are delivered.
fn done_result(done: DoneEvent) -> Result<bool, Error> {
    match (done.error(), done.deadline_hit) {
        (Some(message), true) => Err(Error::timeout(message.to_owned())),
        (Some(message), false) => Err(Error::permanent(message.to_owned())),
        (None, true) => Err(Error::timeout("searcher deadline hit")),
        (None, false) => Ok(done.limit_hit),
    }
}
