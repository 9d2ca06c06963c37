use std::io;
use std::path::PathBuf;

use guest_common::{Category, DurationError};

/// Why a single descriptor file was rejected.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("unreadable: {0}")]
    Unreadable(#[from] io::Error),

    #[error("no PATH entry")]
    MissingPath,

    #[error("bad DELAY {value:?}: {source}")]
    BadDelay {
        value: String,
        #[source]
        source: DurationError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot read descriptor directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },
}

impl SupervisorError {
    pub fn category(&self) -> Category {
        match self {
            SupervisorError::ReadDir { .. } => Category::Process,
            SupervisorError::Descriptor { .. } => Category::Malformed,
        }
    }
}

/// A service could not be run to completion. Exits, clean or not, are not
/// errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("cannot start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("lost track of {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ServiceError {
    pub fn category(&self) -> Category {
        Category::Operation
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
