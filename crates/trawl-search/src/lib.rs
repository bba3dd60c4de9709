//! Fan-out search over the searcher fleet and the code index.
//!
//! A [`Searcher`] partitions a query's repository revisions between the index and remote
//! searchers, sends the indexed part as one compiled query and dispatches the rest per revision
//! through a [`DispatchClient`]. Matches and per-repository statuses stream into an
//! [`AggregationSink`] as they arrive.

mod dispatch;
mod job;
mod sink;
mod transport;

pub use dispatch::{
    CommitResolver, DispatchClient, DispatchOptions, RevisionSearch, MAX_ATTEMPTS,
};
pub use job::{SearchQuery, SearchStats, Searcher, SearcherOptions};
pub use sink::{AggregationSink, CollectingSink, RepoMatches, SearchEvent};
pub use transport::{HttpTransport, Transport};
