//! Crate-level error types.

use std::path::PathBuf;

/// A condition that blocks an operation before it starts. The caller's state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    /// Open documents have unsaved changes.
    #[error(
        "save open documents first: {}",
        .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
    )]
    DirtyDocuments(Vec<PathBuf>),
    /// A generation request is still running and was not cancelled first.
    #[error("a request is already running; cancel it first")]
    AlreadyRunning,
    /// The refinement note is empty or whitespace only.
    #[error("refinement note cannot be empty")]
    BlankNote,
    /// There is no previous request to repeat or refine.
    #[error("no previous request")]
    NoPreviousRequest,
}

/// Errors produced by fragment resolution, template selection and the request lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Several documents reference the same file and the caller must choose one.
    #[error(
        "ambiguous: {} is referenced by {}",
        path.display(),
        candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
    )]
    Ambiguous {
        /// Filenames of the referencing documents.
        candidates: Vec<PathBuf>,
        /// The referenced path.
        path: PathBuf,
    },

    /// The generation backend failed. Reported to the user verbatim.
    #[error("{0}")]
    Generation(String),

    /// A template definition could not be loaded.
    #[error("invalid template `{id}`: {reason}")]
    InvalidTemplate { id: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The identifier resolves to nothing.
    #[error("no fragment found for {identifier}")]
    NotFound { identifier: String },

    /// An operation was refused before it started.
    #[error(transparent)]
    Precondition(#[from] Precondition),

    /// A fragment id captured before a re-parse no longer exists.
    #[error("fragment `{full_id}` no longer exists")]
    Stale { full_id: String },

    #[error("toml deserialize: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// No template with this id is in the catalog.
    #[error("unknown template `{id}`")]
    UnknownTemplate { id: String },

    /// The user dismissed a picker or input box.
    #[error("cancelled")]
    UserCancelled,
}

impl Error {
    /// Stale handles are reported the same way as missing ones at the resolution boundary.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Stale { .. })
    }

    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
