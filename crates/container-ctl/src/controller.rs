//! Container lifecycles: pull, compose, create, run, clean up.

use std::path::PathBuf;
use std::sync::Arc;

use guest_common::PowerControl;
use metadata_watch::ContainerDirective;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, Result};
use crate::persistent::PersistentContainerSpec;
use crate::runtime::{ContainerRuntime, ImageConfig, NewContainer, ResolvedImage, TaskIo};
use crate::spec::{self, Flags, Mount, Spec, SpecContext, SpecRequest};

/// What to put in a container's spec beyond the defaults.
#[derive(Debug, Clone, Default)]
pub struct SpecSettings {
    /// JSON fragment merged over the base spec.
    pub fragment: String,
    /// Start from an empty spec instead of the defaults.
    pub replace: bool,
    pub mounts: Vec<Mount>,
    pub host_network: bool,
    pub privileged: bool,
    pub all_devices_allowed: bool,
    pub host_devices: bool,
}

impl From<&ContainerDirective> for SpecSettings {
    fn from(directive: &ContainerDirective) -> Self {
        SpecSettings {
            fragment: directive.spec.clone(),
            replace: directive.overwrite_defaults,
            ..Default::default()
        }
    }
}

/// Drives containers through a [`ContainerRuntime`].
pub struct Controller {
    runtime: Arc<dyn ContainerRuntime>,
    namespace: String,
    io: TaskIo,
    device_root: PathBuf,
}

impl Controller {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, namespace: impl Into<String>) -> Self {
        Controller {
            runtime,
            namespace: namespace.into(),
            io: TaskIo::Console,
            device_root: PathBuf::from("/dev"),
        }
    }

    /// Where task stdout and stderr go.
    pub fn with_io(mut self, io: TaskIo) -> Self {
        self.io = io;
        self
    }

    /// Directory scanned for host device passthrough.
    pub fn with_device_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.device_root = root.into();
        self
    }

    /// Make sure `reference` is in the local store, pulling it if not.
    pub async fn ensure_image(&self, reference: &str) -> Result<ResolvedImage> {
        let images = self.runtime.list_images().await?;
        if images.iter().any(|name| name == reference) {
            info!(image = reference, "image found locally");
        } else {
            info!(image = reference, "image not found locally, pulling");
            self.runtime.pull_image(reference).await?;
        }
        self.runtime.resolve_image(reference).await
    }

    /// Compose the spec for container `id`.
    pub fn build_spec(
        &self,
        id: &str,
        image: Option<&ImageConfig>,
        settings: &SpecSettings,
    ) -> Result<Spec> {
        let host_devices = settings
            .host_devices
            .then(|| spec::devices::scan(&self.device_root));
        let request = SpecRequest {
            image,
            fragment: &settings.fragment,
            replace: settings.replace,
            mounts: settings.mounts.clone(),
            flags: Flags {
                host_network: settings.host_network,
                privileged: settings.privileged,
                all_devices_allowed: settings.all_devices_allowed,
                host_devices,
            },
        };
        let ctx = SpecContext {
            namespace: &self.namespace,
            id,
        };
        spec::build_spec(&ctx, &request)
    }

    /// Run one task of container `id` until it exits and delete the task.
    /// Returns the exit status. The container itself is left alone.
    pub async fn run_to_completion(&self, id: &str) -> Result<u32> {
        let pid = self.runtime.create_task(id, &self.io).await?;
        debug!(container = id, pid, "task created");

        let status = match self.start_and_wait(id).await {
            Ok(status) => status,
            Err(e) => {
                if let Err(cleanup) = self.runtime.delete_task(id).await {
                    warn!(container = id, error = %cleanup, "failed to delete task");
                }
                return Err(e);
            }
        };
        info!(container = id, status, "task exited");
        self.runtime.delete_task(id).await?;
        Ok(status)
    }

    async fn start_and_wait(&self, id: &str) -> Result<u32> {
        self.runtime.start_task(id).await?;
        self.runtime.wait_task(id).await
    }

    /// Run the directive's image in a fresh container, then delete the
    /// container and its snapshot whatever happened.
    pub async fn run_from_directive(&self, directive: &ContainerDirective) -> Result<u32> {
        let reference = directive.reference.trim();
        info!(image = reference, "running container from directive");
        let image = self.ensure_image(reference).await?;
        let parent = image.chain_id.clone().ok_or_else(|| ControlError::Image {
            reference: reference.to_string(),
            reason: "image has no layers".into(),
        })?;

        let id = new_container_id();
        let spec = self.build_spec(&id, Some(&image.config), &SpecSettings::from(directive))?;
        debug!(container = %id, spec = %spec.as_value(), "composed spec");
        self.runtime
            .create_container(NewContainer {
                id: id.clone(),
                image: Some(reference.to_string()),
                spec,
                snapshot_parent: Some(parent),
            })
            .await?;

        let result = self.run_to_completion(&id).await;
        if let Err(e) = self.runtime.delete_container(&id).await {
            error!(container = %id, error = %e, "failed to delete container");
        }
        result
    }

    /// Run the persistent container `spec.id`, creating it on first use.
    /// The container outlives the run.
    pub async fn run_from_persistent_spec(&self, spec: &PersistentContainerSpec) -> Result<u32> {
        let existing = self.runtime.list_containers().await?;
        if existing.iter().any(|id| id == &spec.id) {
            debug!(container = %spec.id, "reusing container");
            // A task left behind by an unclean previous run blocks creation.
            if let Err(e) = self.runtime.delete_task(&spec.id).await {
                warn!(container = %spec.id, error = %e, "failed to delete stale task");
            }
        } else {
            let composed = self.build_spec(&spec.id, None, &spec.settings()?)?;
            self.runtime
                .create_container(NewContainer {
                    id: spec.id.clone(),
                    image: None,
                    spec: composed,
                    snapshot_parent: None,
                })
                .await?;
            info!(container = %spec.id, "created persistent container");
        }
        self.run_to_completion(&spec.id).await
    }
}

/// Timestamp-based container ID, unique per directive.
pub fn new_container_id() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string()
}

/// After a directive's container: power off if asked to, otherwise return.
///
/// Power-off is not confirmed; if the call fails or returns this waits
/// forever rather than resuming the directive loop.
pub async fn apply_exit_policy(stop_on_exit: bool, power: &dyn PowerControl) {
    if !stop_on_exit {
        return;
    }
    info!("stop-on-exit set, shutting down");
    power.sync();
    if let Err(e) = power.power_off() {
        error!(error = %e, "power off failed");
    }
    std::future::pending::<()>().await;
}
