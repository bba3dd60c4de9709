use parking_lot::Mutex;
use tokio::sync::mpsc;
use trawl_core::{RepoId, RepoStatus, RepoStatusMap};
use trawl_proto::FileMatch;

/// Matches found in one revision of one repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoMatches {
    pub repo_id: RepoId,
    pub repo: String,
    /// Revision the matches were found at; empty for the default branch.
    pub rev: String,
    pub matches: Vec<FileMatch>,
}

/// One update of a query's merged result stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchEvent {
    pub matches: Vec<RepoMatches>,
    pub status: RepoStatusMap,
}

impl SearchEvent {
    pub fn matches(matches: RepoMatches) -> Self {
        Self {
            matches: vec![matches],
            status: RepoStatusMap::new(),
        }
    }

    pub fn status(repo: RepoId, status: RepoStatus) -> Self {
        let mut map = RepoStatusMap::new();
        map.update(repo, status);
        Self {
            matches: Vec::new(),
            status: map,
        }
    }
}

/// Consumer of a query's results and per-repository statuses.
///
/// Called concurrently from every repository task; events of one repository arrive in order.
pub trait AggregationSink: Send + Sync {
    fn send(&self, event: SearchEvent);
}

impl AggregationSink for mpsc::UnboundedSender<SearchEvent> {
    fn send(&self, event: SearchEvent) {
        // The receiver going away means the caller stopped listening.
        let _ = mpsc::UnboundedSender::send(self, event);
    }
}

/// Buffers every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SearchEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SearchEvent> {
        self.events.lock().clone()
    }

    pub fn matches(&self) -> Vec<RepoMatches> {
        self.events
            .lock()
            .iter()
            .flat_map(|event| event.matches.iter().cloned())
            .collect()
    }

    /// Every status update merged into one map.
    pub fn status(&self) -> RepoStatusMap {
        let mut merged = RepoStatusMap::new();
        for event in self.events.lock().iter() {
            merged.merge(&event.status);
        }
        merged
    }
}

impl AggregationSink for CollectingSink {
    fn send(&self, event: SearchEvent) {
        self.events.lock().push(event);
    }
}
