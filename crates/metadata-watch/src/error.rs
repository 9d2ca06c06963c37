use guest_common::Category;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("metadata server returned HTTP {0}")]
    Status(u16),

    #[error("cannot read metadata response: {0}")]
    Body(#[source] reqwest::Error),

    #[error("malformed directive: {0}")]
    Malformed(#[source] serde_json::Error),
}

impl WatchError {
    pub fn category(&self) -> Category {
        match self {
            WatchError::Client(_) => Category::Process,
            WatchError::Status(_) | WatchError::Body(_) => Category::Transient,
            WatchError::Malformed(_) => Category::Malformed,
        }
    }
}
