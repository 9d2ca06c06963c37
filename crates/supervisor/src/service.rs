use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServiceError;

/// Something the supervisor can run over and over.
///
/// Implemented by plain processes and by persistent containers.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Pause before every start, the first one included.
    fn delay(&self) -> Option<Duration> {
        None
    }

    /// Run once until the service exits. Returns the exit code, or `None`
    /// when the process was killed by a signal.
    async fn run(&self) -> Result<Option<i32>, ServiceError>;
}
