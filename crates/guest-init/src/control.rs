//! The foreground loop: wait for a directive, run its container, repeat.

use std::time::Duration;

use async_trait::async_trait;
use container_ctl::{Controller, apply_exit_policy};
use guest_common::PowerControl;
use metadata_watch::{ContainerDirective, MetadataWatcher, WatchError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause after a failed poll before polling again.
pub const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);
/// Pause after a container run failed.
pub const RUN_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Where directives come from.
#[async_trait]
pub trait DirectiveSource: Send {
    /// Next changed directive, or `None` once `cancel` fires.
    async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ContainerDirective>, WatchError>;
}

#[async_trait]
impl DirectiveSource for MetadataWatcher {
    async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ContainerDirective>, WatchError> {
        self.watch(cancel).await
    }
}

/// Run directives until cancelled, or until a stop-on-exit directive
/// powers the machine off (in which case this never returns).
pub async fn run(
    source: &mut dyn DirectiveSource,
    controller: &Controller,
    power: &dyn PowerControl,
    cancel: &CancellationToken,
) {
    loop {
        info!("waiting for metadata");
        let directive = match source.next(cancel).await {
            Ok(Some(directive)) => directive,
            Ok(None) => {
                info!("directive loop cancelled");
                return;
            }
            Err(e) => {
                warn!(error = %e, category = %e.category(), "metadata poll failed");
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
                continue;
            }
        };

        if !directive.has_container() {
            info!("no container set, waiting");
            continue;
        }

        match controller.run_from_directive(&directive).await {
            Ok(status) => info!(image = %directive.reference, status, "container finished"),
            Err(e) => {
                error!(image = %directive.reference, error = %e, "container run failed");
                tokio::time::sleep(RUN_ERROR_PAUSE).await;
            }
        }

        apply_exit_policy(directive.stop_on_exit, power).await;
        info!(image = %directive.reference, "waiting for next directive");
    }
}
