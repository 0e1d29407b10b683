//! Error types for uow-rs.

use thiserror::Error;

use crate::model::Phase;

/// Step of the commit or abort sequence that raised a [`Error::WorkFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Opening the transaction handle.
    Begin,
    /// A work unit's `perform`.
    Perform,
    /// A work unit's `abort`.
    Abort,
    /// Handing the event batch to the publisher.
    Publish,
    /// Committing the transaction handle.
    Commit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Begin => "begin",
            Stage::Perform => "perform",
            Stage::Abort => "abort",
            Stage::Publish => "publish",
            Stage::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unit of work is not started (phase: {phase})")]
    NotStarted { phase: Phase },

    #[error("unit of work is already completed (committed or aborted)")]
    AlreadyCompleted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("work failed during {stage}: {source}")]
    WorkFailure {
        stage: Stage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a collaborator error raised while draining a unit of work.
    pub(crate) fn work_failure(stage: Stage, source: Error) -> Self {
        Error::WorkFailure {
            stage,
            source: Box::new(source),
        }
    }

    /// The failing stage, if this is a [`Error::WorkFailure`].
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::WorkFailure { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Did a store give up waiting for another operation's transaction?
    ///
    /// Looks through [`Error::WorkFailure`] to the underlying cause.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Storage(e) => e.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy),
            Error::WorkFailure { source, .. } => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_busy),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
