use serde::{Deserialize, Serialize};

/// Pattern and filters of one text search, shared by the index and the per-repository searchers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternInfo {
    pub pattern: String,
    pub is_negated: bool,
    pub is_regexp: bool,
    pub is_structural: bool,
    pub is_word_match: bool,
    pub is_case_sensitive: bool,
    /// Paths matching this regex are skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<String>,
    /// Every path regex in the list must match.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,
    pub path_patterns_are_case_sensitive: bool,
    /// Maximum number of matches to return. Zero means the worker's default.
    pub limit: usize,
    pub pattern_matches_content: bool,
    pub pattern_matches_path: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Result type selector (`file`, `content`, `repo`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
    /// Repositories are only searched if they contain a file matching each of these path regexes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_patterns_repos_must_include: Vec<String>,
    /// Repositories are skipped if they contain a file matching any of these path regexes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_patterns_repos_must_exclude: Vec<String>,
}

impl PatternInfo {
    /// A literal content-and-path pattern with default flags.
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            pattern_matches_content: true,
            pattern_matches_path: true,
            ..Default::default()
        }
    }

    pub fn regexp(pattern: impl Into<String>) -> Self {
        Self {
            is_regexp: true,
            ..Self::literal(pattern)
        }
    }

    pub fn has_repo_file_filters(&self) -> bool {
        !self.file_patterns_repos_must_include.is_empty()
            || !self.file_patterns_repos_must_exclude.is_empty()
    }
}

/// Request for one repository at one resolved commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub repo: String,
    pub repo_id: u32,
    pub commit_oid: String,
    /// Branch the commit was resolved from; empty for the default branch.
    #[serde(default)]
    pub branch: String,
    /// The commit is also present in the index, so the worker may use it.
    #[serde(default)]
    pub indexed: bool,
    /// How long the worker may spend fetching the commit before giving up.
    #[serde(default)]
    pub fetch_timeout_ms: u64,
    pub pattern_info: PatternInfo,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Byte offset from the start of the file.
    pub offset: u32,
    /// Zero-based line number.
    pub line: u32,
    /// Zero-based column, in characters.
    pub column: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Location,
    pub end: Location,
}

/// A contiguous run of lines containing one or more matches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub content: String,
    pub content_start: Location,
    #[serde(default)]
    pub ranges: Vec<Range>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatch {
    pub path: String,
    #[serde(default)]
    pub chunk_matches: Vec<ChunkMatch>,
    #[serde(default)]
    pub limit_hit: bool,
}

impl FileMatch {
    pub fn path_only(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Number of matches in this file. A match on the path alone counts as one.
    pub fn match_count(&self) -> usize {
        let ranges: usize = self.chunk_matches.iter().map(|chunk| chunk.ranges.len()).sum();
        ranges.max(1)
    }
}

/// Payload of the terminal frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    #[serde(default)]
    pub limit_hit: bool,
    /// The worker stopped because its own deadline expired.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deadline_hit: bool,
    /// Application error reported by the worker; empty when the search succeeded.
    #[serde(default)]
    pub error: String,
}

impl DoneEvent {
    pub fn error(&self) -> Option<&str> {
        (!self.error.is_empty()).then_some(self.error.as_str())
    }
}

/// One decoded frame of a worker's event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchFrame {
    Matches(Vec<FileMatch>),
    Done(DoneEvent),
    Unknown { event: String, data: String },
}
