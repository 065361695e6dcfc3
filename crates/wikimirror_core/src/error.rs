use std::path::PathBuf;

use thiserror::Error;

/// Failure to read one of the textual formats into a tree.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed HTML: {0}")]
    Html(String),
    #[error("malformed front matter: {0}")]
    FrontMatter(String),
}

/// A document that no encoder can represent faithfully.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("unsupported document version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("heading level {0} is outside 1..=6")]
    InvalidHeadingLevel(u8),
    #[error("failed to serialize document: {0}")]
    Serialize(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rate limited by wiki API (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("page {0} not found")]
    NotFound(String),
    #[error("wiki API request failed with HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to call wiki API: {0}")]
    Transport(String),
    #[error("failed to decode wiki API response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git executable not found on PATH")]
    NotInstalled,
    #[error("{} is not a git repository; run `wikimirror init` first", .0.display())]
    NotInitialized(PathBuf),
    #[error("nothing to commit")]
    NoChanges,
    #[error("repository has unresolved merge conflicts")]
    MergeConflict,
    #[error("`git {command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("conflict: {0} changed both locally and remotely")]
    Conflict(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error("working tree has uncommitted changes; commit or stash them before pushing")]
    UncommittedChanges,
    #[error("sync ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
}

impl SyncError {
    pub fn file_system(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
