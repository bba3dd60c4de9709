use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use trawl_core::{Error, RepoId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedBranch {
    pub name: String,
    /// Commit the branch pointed at when it was indexed.
    pub commit: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRepo {
    pub id: RepoId,
    pub name: String,
    pub branches: Vec<IndexedBranch>,
    /// The index also carries symbol information for this repository.
    #[serde(default)]
    pub has_symbols: bool,
}

impl IndexedRepo {
    /// The indexed branch `rev_spec` refers to: an exact branch name, or a prefix of at least four
    /// characters of an indexed commit.
    pub fn branch_for(&self, rev_spec: &str) -> Option<&IndexedBranch> {
        if let Some(branch) = self.branches.iter().find(|b| b.name == rev_spec) {
            return Some(branch);
        }
        if rev_spec.len() < 4 {
            return None;
        }
        self.branches
            .iter()
            .find(|b| b.commit.len() >= rev_spec.len() && b.commit.starts_with(rev_spec))
    }
}

/// What the index backend has indexed, keyed by repository id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexCatalog {
    repos: HashMap<RepoId, IndexedRepo>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, repo: IndexedRepo) {
        self.repos.insert(repo.id, repo);
    }

    pub fn get(&self, id: RepoId) -> Option<&IndexedRepo> {
        self.repos.get(&id)
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedRepo> {
        self.repos.values()
    }

    /// Parses a JSON array of [`IndexedRepo`].
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let repos: Vec<IndexedRepo> = serde_json::from_str(json)
            .map_err(|err| Error::config(format!("invalid index catalog: {err}")))?;
        Ok(repos.into_iter().collect())
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| Error::config(format!("failed to read {}: {err}", path.display())))?;
        Self::from_json(&json)
    }
}

impl FromIterator<IndexedRepo> for IndexCatalog {
    fn from_iter<T: IntoIterator<Item = IndexedRepo>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for repo in iter {
            catalog.insert(repo);
        }
        catalog
    }
}
