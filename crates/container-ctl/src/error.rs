use std::io;
use std::path::PathBuf;

use guest_common::Category;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("cannot connect to container runtime at {socket}: {reason}")]
    Connect { socket: PathBuf, reason: String },

    #[error("{op} {target}: {reason}")]
    Runtime {
        op: &'static str,
        target: String,
        reason: String,
        not_found: bool,
    },

    #[error("pull {reference}: {reason}")]
    Pull { reference: String, reason: String },

    #[error("image {reference}: {reason}")]
    Image { reference: String, reason: String },

    #[error("invalid spec: {0}")]
    Spec(String),

    #[error("malformed container descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ControlError {
    pub fn category(&self) -> Category {
        match self {
            ControlError::Connect { .. } => Category::Process,
            ControlError::Descriptor { .. } => Category::Malformed,
            ControlError::Runtime { .. }
            | ControlError::Pull { .. }
            | ControlError::Image { .. }
            | ControlError::Spec(_)
            | ControlError::Io { .. } => Category::Operation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::Runtime { not_found: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
