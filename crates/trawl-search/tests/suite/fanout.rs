use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use trawl_core::{parse_repository_revisions, Error, ErrorKind, Repo, RepoStatus, RepositoryRevisions};
use trawl_index::{IndexBackend, IndexCatalog, IndexMode, IndexedBranch, IndexedRepo};
use trawl_proto::PatternInfo;
use trawl_scheduler::RequestContext;
use trawl_search::{CollectingSink, SearchQuery, Searcher, SearcherOptions, Transport};

use super::support::{client, done, file, FakeIndex, FnTransport, UnevenFleetTransport};

fn repo(id: u32, spec: &str) -> RepositoryRevisions {
    let (name, revs) = parse_repository_revisions(spec);
    RepositoryRevisions::new(Repo::new(id, name), revs)
}

fn catalog() -> IndexCatalog {
    [IndexedRepo {
        id: 1,
        name: "indexed".to_owned(),
        branches: vec![IndexedBranch {
            name: "HEAD".to_owned(),
            commit: "abcdef0123".to_owned(),
        }],
        has_symbols: false,
    }]
    .into_iter()
    .collect()
}

fn searcher(transport: Arc<dyn Transport>, index: Option<Arc<dyn IndexBackend>>) -> Searcher {
    Searcher::new(
        Arc::new(client(&["a", "b", "c"], transport)),
        index,
        SearcherOptions::default(),
    )
}

fn query(repos: Vec<RepositoryRevisions>) -> SearchQuery {
    SearchQuery {
        repos,
        pattern: PatternInfo::literal("foo"),
        ..SearchQuery::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_query_reports_partial_results() -> Result<()> {
    let transport = FnTransport::new(|_, request, _| match request.repo.as_str() {
        "bad" => Err(Error::protocol("malformed frame")),
        _ => Ok((vec![file("main.go")], done())),
    });
    let index = FakeIndex::new(catalog());
    let backend: Arc<dyn IndexBackend> = index.clone();
    let searcher = searcher(transport.clone(), Some(backend));
    let sink = Arc::new(CollectingSink::new());

    let stats = searcher
        .search(
            &RequestContext::background(),
            query(vec![
                repo(1, "indexed"),
                repo(2, "plain"),
                repo(3, "cloning/big"),
                repo(4, "bad"),
                repo(5, "missing/gone"),
            ]),
            sink.clone(),
        )
        .await?;

    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED | RepoStatus::INDEXED);
    assert_eq!(stats.status.get(2), RepoStatus::SEARCHED);
    assert_eq!(stats.status.get(3), RepoStatus::CLONING);
    assert!(stats.status.get(4).is_empty());
    assert_eq!(stats.status.get(5), RepoStatus::MISSING);
    assert_eq!(stats.repo_errors.len(), 1);
    assert_eq!(stats.repo_errors[0].kind(), ErrorKind::Protocol);
    assert!(!stats.index_unavailable);

    // The sink saw the same statuses the summary reports.
    assert_eq!(sink.status(), stats.status);

    let mut repos: Vec<_> = sink.matches().into_iter().map(|m| m.repo).collect();
    repos.sort();
    assert_eq!(repos, vec!["indexed", "plain"]);

    // The indexed repository never reached a searcher.
    assert!(transport.calls().iter().all(|(_, request)| request.repo != "indexed"));
    assert_eq!(index.queries.lock().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_and_overloaded_repos_time_out_without_failing_siblings() -> Result<()> {
    let searcher = searcher(Arc::new(UnevenFleetTransport), None);
    let sink = Arc::new(CollectingSink::new());
    let ctx = RequestContext::background().with_timeout(Duration::from_millis(200));

    let stats = searcher
        .search(
            &ctx,
            query(vec![repo(1, "healthy"), repo(2, "slow/big"), repo(3, "flaky/busy")]),
            sink.clone(),
        )
        .await?;

    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED);
    assert_eq!(stats.status.get(2), RepoStatus::TIMED_OUT);
    assert_eq!(stats.status.get(3), RepoStatus::TIMED_OUT);
    assert!(stats.repo_errors.is_empty());

    let matches = sink.matches();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].repo, "healthy");
    assert_eq!(matches[0].matches, vec![file("main.go")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn structural_patterns_bypass_the_index() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((vec![file("main.go")], done())));
    let index = FakeIndex::new(catalog());
    let backend: Arc<dyn IndexBackend> = index.clone();
    let searcher = searcher(transport.clone(), Some(backend));
    let structural = SearchQuery {
        pattern: PatternInfo {
            is_structural: true,
            ..PatternInfo::literal("fmt.Println(:[args])")
        },
        ..query(vec![repo(1, "indexed")])
    };

    let stats = searcher
        .search(&RequestContext::background(), structural.clone(), Arc::new(CollectingSink::new()))
        .await?;
    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED);
    assert_eq!(transport.calls().len(), 1);
    assert!(index.queries.lock().is_empty());

    let err = searcher
        .search(
            &RequestContext::background(),
            SearchQuery {
                index_mode: IndexMode::Only,
                ..structural
            },
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_failure_fails_the_query() -> Result<()> {
    let transport = FnTransport::new(|_, request, _| match request.repo.as_str() {
        "broken" => Err(Error::permanent("invalid request")),
        _ => Ok((Vec::new(), done())),
    });
    let searcher = searcher(transport, None);

    let err = searcher
        .search(
            &RequestContext::background(),
            query(vec![repo(1, "ok"), repo(2, "broken")]),
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    Ok(())
}

#[tokio::test]
async fn unknown_explicit_revision_fails_the_query() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((Vec::new(), done())));
    let searcher = searcher(transport, None);

    let err = searcher
        .search(
            &RequestContext::background(),
            query(vec![repo(1, "repo@nope")]),
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevisionNotFound);
    Ok(())
}

#[tokio::test]
async fn empty_fleet_fails_the_query() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((Vec::new(), done())));
    let searcher = Searcher::new(
        Arc::new(client(&[], transport)),
        None,
        SearcherOptions::default(),
    );

    let err = searcher
        .search(
            &RequestContext::background(),
            query(vec![repo(1, "repo")]),
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyRouting);
    Ok(())
}

#[tokio::test]
async fn index_only_without_index_is_rejected() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((Vec::new(), done())));
    let searcher = Searcher::new(
        Arc::new(client(&["a"], transport)),
        None,
        SearcherOptions {
            index_enabled: false,
            ..SearcherOptions::default()
        },
    );

    let err = searcher
        .search(
            &RequestContext::background(),
            SearchQuery {
                index_mode: IndexMode::Only,
                ..query(vec![repo(1, "repo")])
            },
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn match_limit_stops_the_fanout() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((vec![file("a.go"), file("b.go")], done())));
    let searcher = searcher(transport, None);
    let sink = Arc::new(CollectingSink::new());

    let repos = (1..=20).map(|id| repo(id, &format!("repo{id}"))).collect();
    let stats = searcher
        .search(
            &RequestContext::background(),
            SearchQuery {
                pattern: PatternInfo {
                    limit: 3,
                    ..PatternInfo::literal("foo")
                },
                ..query(repos)
            },
            sink.clone(),
        )
        .await?;

    assert!(stats.limit_hit);
    let delivered: usize = sink.matches().iter().map(|m| m.matches.len()).sum();
    assert_eq!(delivered, 3);
    Ok(())
}

#[tokio::test]
async fn multiple_revisions_are_searched_separately() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((vec![file("main.go")], done())));
    let searcher = searcher(transport.clone(), None);
    let sink = Arc::new(CollectingSink::new());

    let stats = searcher
        .search(
            &RequestContext::background(),
            query(vec![repo(1, "repo@main:dev")]),
            sink.clone(),
        )
        .await?;

    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED);
    let mut commits: Vec<_> = transport
        .calls()
        .into_iter()
        .map(|(_, request)| request.commit_oid)
        .collect();
    commits.sort();
    assert_eq!(commits, vec!["sha-dev", "sha-main"]);

    let mut revs: Vec<_> = sink.matches().into_iter().map(|m| m.rev).collect();
    revs.sort();
    assert_eq!(revs, vec!["dev", "main"]);
    Ok(())
}

#[tokio::test]
async fn repo_file_filters_skip_indexed_repos_without_files() -> Result<()> {
    let transport = FnTransport::new(|_, _, _| Ok((Vec::new(), done())));
    let index = FakeIndex::new(catalog());
    let backend: Arc<dyn IndexBackend> = index.clone();
    let searcher = searcher(transport, Some(backend));

    let stats = searcher
        .search(
            &RequestContext::background(),
            SearchQuery {
                pattern: PatternInfo {
                    file_patterns_repos_must_exclude: vec![r"vendor/".to_owned()],
                    ..PatternInfo::literal("foo")
                },
                ..query(vec![repo(1, "indexed")])
            },
            Arc::new(CollectingSink::new()),
        )
        .await?;

    // The fake index reports a file for every restricted repository, so the exclude filter drops
    // the only repository before the pattern query runs.
    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED | RepoStatus::INDEXED);
    assert_eq!(index.queries.lock().len(), 1);
    Ok(())
}
