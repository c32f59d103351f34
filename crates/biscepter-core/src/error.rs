use std::path::PathBuf;

/// Unified error type covering all failure modes of the bisection engine.
///
/// Broken *non-endpoint* commits are not errors: builds and healthchecks that
/// fail for an interior commit are absorbed by the replacement map and the
/// probe retries transparently. Everything surfaced here either aborts job
/// startup ([`InvalidConfig`](Self::InvalidConfig),
/// [`UnreachableRange`](Self::UnreachableRange)) or terminates the affected
/// replica ([`EndpointUnbuildable`](Self::EndpointUnbuildable), tool errors).
#[derive(Debug, thiserror::Error)]
pub enum BisectError {
    /// The job configuration is unusable as given.
    #[error("invalid job configuration: {field} = {value:?}: {reason}")]
    InvalidConfig {
        /// Which configuration field is at fault.
        field: String,
        /// The offending value, as provided.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The good commit cannot be reached from the bad commit along
    /// first-parent history, so no bisectable range exists.
    #[error(
        "good commit {good} is not reachable from bad commit {bad} along first-parent history"
    )]
    UnreachableRange {
        /// The configured good commit.
        good: String,
        /// The configured bad commit.
        bad: String,
    },

    /// An external tool (`git`, `docker`, `curl`, ...) exited non-zero.
    #[error("{tool} {args:?} failed ({status}): {stderr}")]
    ToolFailed {
        /// The tool binary name.
        tool: &'static str,
        /// The arguments it was invoked with.
        args: Vec<String>,
        /// Its exit status, rendered.
        status: String,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// An external tool could not be spawned at all (not installed, not on
    /// `PATH`).
    #[error("failed to spawn {tool}: {source}. Is it installed and on PATH?")]
    ToolUnavailable {
        /// The tool binary name.
        tool: &'static str,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A commit at the end of the bisected range failed to build. Bisection
    /// correctness requires both endpoints to build, so this is terminal for
    /// the replica and points at a misconfigured range or Dockerfile.
    #[error(
        "endpoint commit {commit} cannot be built; bisection requires both range endpoints to build. Check the Dockerfile and the chosen good/bad commits."
    )]
    EndpointUnbuildable {
        /// The unbuildable endpoint commit.
        commit: String,
    },

    /// The replacement journal on disk could not be parsed.
    #[error("replacement journal at {path} is corrupt: {reason}. Delete it to start fresh.")]
    JournalCorrupt {
        /// Journal file path.
        path: PathBuf,
        /// What failed to parse.
        reason: String,
    },

    /// A commit hash was expected to be part of the bisected range but is not.
    #[error("commit {commit} is not part of the bisected commit sequence")]
    UnknownCommit {
        /// The unknown hash.
        commit: String,
    },

    /// A commit offset was outside the bisected range.
    #[error("commit offset {offset} is not between 0 and {len}, the number of commits")]
    OffsetOutOfRange {
        /// The requested offset.
        offset: usize,
        /// Number of commits in the range.
        len: usize,
    },

    /// The replica was stopped before it could produce a result.
    #[error("replica {replica} was stopped before completing its bisection")]
    ReplicaStopped {
        /// Index of the stopped replica.
        replica: usize,
    },

    /// No free host port could be allocated for a container port binding.
    #[error("could not allocate a host port on {host}: {source}")]
    PortAllocation {
        /// Host bind address.
        host: String,
        /// The underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error with the path that triggered it.
    #[error("i/o error at {path}: {source}")]
    Io {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias used across all biscepter crates.
pub type BisectResult<T> = Result<T, BisectError>;

impl BisectError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
