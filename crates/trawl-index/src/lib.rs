//! Everything trawl knows about the code index.
//!
//! The index backend owns pre-built indexes for some branches of some repositories. This crate
//! lists what is indexed ([`IndexCatalog`]), decides which repository revisions can be answered
//! from the index ([`RepoPartitioner`]) and compiles a pattern into the backend's query tree
//! ([`QueryCompiler`]).

mod backend;
mod catalog;
mod partition;
mod query;

pub use backend::{IndexBackend, IndexSearchOptions, IndexSearchStats, IndexedMatches};
pub use catalog::{IndexCatalog, IndexedBranch, IndexedRepo};
pub use partition::{
    partition_with_catalog, IndexMode, IndexedRepoRevs, Partition, PartitionOptions,
    RepoPartitioner,
};
pub use query::{QueryCompiler, Q};
