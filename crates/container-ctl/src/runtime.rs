//! The boundary to the container runtime daemon.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::spec::Spec;

/// The `config` section of an OCI image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// An image present in the daemon's store, unpacked for this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub name: String,
    pub config: ImageConfig,
    /// Chain ID of the top layer: the parent for container snapshots.
    pub chain_id: Option<String>,
}

/// Everything needed to register a container with the daemon.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub image: Option<String>,
    pub spec: Spec,
    /// Allocate a writable snapshot named after the container on top of
    /// this parent. `None` means the OCI spec's root is a host path.
    pub snapshot_parent: Option<String>,
}

/// Where a task's stdout and stderr go. Stdin is always closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIo {
    /// The machine console.
    Console,
    /// Append to a file.
    File(PathBuf),
    Null,
}

impl TaskIo {
    /// URI form understood by the runc shim.
    pub fn uri(&self) -> String {
        match self {
            TaskIo::Console => "file:///dev/console".to_string(),
            TaskIo::File(path) => format!("file://{}", path.display()),
            TaskIo::Null => String::new(),
        }
    }
}

/// `console`, `none`, or an absolute file path.
impl FromStr for TaskIo {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "console" => Ok(TaskIo::Console),
            "none" => Ok(TaskIo::Null),
            path if path.starts_with('/') => Ok(TaskIo::File(PathBuf::from(path))),
            other => Err(format!(
                "expected console, none or an absolute path, got {other:?}"
            )),
        }
    }
}

/// Operations the lifecycle controller needs from the daemon.
///
/// Each call is one daemon round trip; sequencing and cleanup live in
/// [`crate::Controller`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of images in the local store.
    async fn list_images(&self) -> Result<Vec<String>>;

    /// Fetch `reference` and unpack it for the current platform.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Read the stored image's configuration and layer chain.
    async fn resolve_image(&self, reference: &str) -> Result<ResolvedImage>;

    async fn list_containers(&self) -> Result<Vec<String>>;

    async fn create_container(&self, container: NewContainer) -> Result<()>;

    /// Create the container's task. Returns the task's pid.
    async fn create_task(&self, id: &str, io: &TaskIo) -> Result<u32>;

    async fn start_task(&self, id: &str) -> Result<()>;

    /// Block until the task exits. Returns its exit status.
    async fn wait_task(&self, id: &str) -> Result<u32>;

    /// Delete the task. Deleting a task that does not exist succeeds.
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Delete the container and its snapshot. Missing pieces are ignored.
    async fn delete_container(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_uris() {
        assert_eq!(TaskIo::Console.uri(), "file:///dev/console");
        assert_eq!(
            TaskIo::File(PathBuf::from("/var/log/app.log")).uri(),
            "file:///var/log/app.log"
        );
        assert_eq!(TaskIo::Null.uri(), "");
    }

    #[test]
    fn io_from_flag_value() {
        assert_eq!("console".parse::<TaskIo>(), Ok(TaskIo::Console));
        assert_eq!("none".parse::<TaskIo>(), Ok(TaskIo::Null));
        assert_eq!(
            "/var/log/containers.log".parse::<TaskIo>(),
            Ok(TaskIo::File(PathBuf::from("/var/log/containers.log")))
        );
        assert!("logs/out".parse::<TaskIo>().is_err());
    }

    #[test]
    fn image_config_uses_oci_field_names() {
        let config: ImageConfig = serde_json::from_str(
            r#"{"User":"1000:1000","Env":["A=1"],"Entrypoint":["/bin/sh"],"Cmd":["-c","true"],"WorkingDir":"/app","Labels":{}}"#,
        )
        .unwrap();
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.env, Some(vec!["A=1".to_string()]));
        assert_eq!(config.entrypoint, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
    }
}
