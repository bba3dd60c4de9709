use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a repository could not be searched. These are outcomes, not search failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RepoUnavailableReason {
    Missing,
    Cloning,
    Unauthorized,
}

impl fmt::Display for RepoUnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepoUnavailableReason::Missing => "missing",
            RepoUnavailableReason::Cloning => "cloning",
            RepoUnavailableReason::Unauthorized => "unauthorized",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// There are no endpoints to route to.
    EmptyRouting,
    /// The backend failed in a way that is worth retrying on another replica.
    Transient,
    /// The request itself is bad; retrying cannot help.
    Permanent,
    /// A deadline was exceeded.
    Timeout,
    RepoUnavailable(RepoUnavailableReason),
    /// The requested revision does not exist in the repository.
    RevisionNotFound,
    /// A wire frame could not be decoded.
    Protocol,
    /// The caller no longer wants results.
    Cancelled,
    /// Endpoint discovery failed or has not produced endpoints yet.
    Discovery,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::EmptyRouting => f.write_str("empty routing"),
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::RepoUnavailable(reason) => write!(f, "repo unavailable ({reason})"),
            ErrorKind::RevisionNotFound => f.write_str("revision not found"),
            ErrorKind::Protocol => f.write_str("protocol"),
            ErrorKind::Cancelled => f.write_str("cancelled"),
            ErrorKind::Discovery => f.write_str("discovery"),
            ErrorKind::Config => f.write_str("config"),
        }
    }
}

/// The error type shared across trawl's search path.
///
/// Callers branch on [`Error::kind`] rather than on concrete source types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    repo: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            repo: None,
        }
    }

    /// Attaches the repository (and revision) the error concerns.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn repo(&self) -> Option<&str> {
        self.repo.as_deref()
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn empty_routing() -> Self {
        Self::new(ErrorKind::EmptyRouting, "no endpoints available")
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Discovery, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn repo_unavailable(reason: RepoUnavailableReason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RepoUnavailable(reason), message)
    }

    pub fn revision_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RevisionNotFound, message)
    }

    /// Prefixes the message with `context`, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            message: format!("{context}: {}", self.message),
            ..self
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Errors that abort the whole dispatch instead of a single repository.
    pub fn aborts_dispatch(&self) -> bool {
        matches!(self.kind, ErrorKind::EmptyRouting | ErrorKind::Cancelled)
    }
}
