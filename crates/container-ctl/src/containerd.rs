//! [`ContainerRuntime`] over the containerd gRPC API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetContainerRequest, GetImageRequest, ListContainersRequest,
    ListImagesRequest, ReadContentRequest, StartRequest, TransferOptions, TransferRequest,
    WaitRequest,
};
use containerd_client::to_any;
use containerd_client::tonic::metadata::AsciiMetadataValue;
use containerd_client::tonic::transport::Channel;
use containerd_client::tonic::{Code, Request, Status};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform as WirePlatform};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::image::{self, Platform, Resolved};
use crate::runtime::{ContainerRuntime, NewContainer, ResolvedImage, TaskIo};

pub const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_NAMESPACE: &str = "caaos";
pub const RUNC_RUNTIME: &str = "io.containerd.runc.v2";
pub const SNAPSHOTTER: &str = "overlayfs";

const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const NAMESPACE_HEADER: &str = "containerd-namespace";
/// Index, manifest, config.
const MAX_IMAGE_DEPTH: usize = 3;

/// A containerd connection scoped to one namespace.
#[derive(Debug, Clone)]
pub struct Containerd {
    channel: Channel,
    namespace: AsciiMetadataValue,
    platform: Platform,
}

impl Containerd {
    pub async fn connect(socket: &Path, namespace: &str) -> Result<Self> {
        let connect_err = |reason: String| ControlError::Connect {
            socket: socket.to_path_buf(),
            reason,
        };
        let namespace: AsciiMetadataValue = namespace
            .parse()
            .map_err(|_| connect_err(format!("invalid namespace {namespace:?}")))?;
        let channel = containerd_client::connect(socket)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(Containerd {
            channel,
            namespace,
            platform: Platform::current(),
        })
    }

    /// Connect, retrying while the daemon is still starting.
    pub async fn connect_with_retry(
        socket: &Path,
        namespace: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::connect(socket, namespace).await {
                Ok(client) => {
                    info!(socket = %socket.display(), attempt, "connected to containerd");
                    return Ok(client);
                }
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "containerd not ready");
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace.clone());
        request
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel.clone());
        let mut stream = client
            .read(self.request(ReadContentRequest {
                digest: digest.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(rpc("read content", digest))?
            .into_inner();
        let mut data = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(rpc("read content", digest))?
        {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    async fn get_container(&self, id: &str) -> Result<Container> {
        let mut client = ContainersClient::new(self.channel.clone());
        client
            .get(self.request(GetContainerRequest { id: id.to_string() }))
            .await
            .map_err(rpc("get container", id))?
            .into_inner()
            .container
            .ok_or_else(|| missing("get container", id))
    }

    async fn rootfs(&self, id: &str) -> Result<Vec<Mount>> {
        let container = self.get_container(id).await?;
        if container.snapshot_key.is_empty() {
            return Ok(Vec::new());
        }
        let mut client = SnapshotsClient::new(self.channel.clone());
        let mounts = client
            .mounts(self.request(MountsRequest {
                snapshotter: container.snapshotter.clone(),
                key: container.snapshot_key.clone(),
            }))
            .await
            .map_err(rpc("snapshot mounts", id))?
            .into_inner()
            .mounts;
        Ok(mounts)
    }

    fn wire_platform(&self) -> WirePlatform {
        WirePlatform {
            os: self.platform.os.clone(),
            architecture: self.platform.architecture.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for Containerd {
    async fn list_images(&self) -> Result<Vec<String>> {
        let mut client = ImagesClient::new(self.channel.clone());
        let images = client
            .list(self.request(ListImagesRequest::default()))
            .await
            .map_err(rpc("list images", "in namespace"))?
            .into_inner()
            .images;
        Ok(images.into_iter().map(|image| image.name).collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let source = OciRegistry {
            reference: reference.to_string(),
            ..Default::default()
        };
        let destination = ImageStore {
            name: reference.to_string(),
            platforms: vec![self.wire_platform()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(self.wire_platform()),
                snapshotter: SNAPSHOTTER.to_string(),
            }],
            ..Default::default()
        };
        let request = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: Some(TransferOptions::default()),
        };
        let mut client = TransferClient::new(self.channel.clone());
        client
            .transfer(self.request(request))
            .await
            .map_err(|status| ControlError::Pull {
                reference: reference.to_string(),
                reason: status.message().to_string(),
            })?;
        Ok(())
    }

    async fn resolve_image(&self, reference: &str) -> Result<ResolvedImage> {
        let image_err = |reason: String| ControlError::Image {
            reference: reference.to_string(),
            reason,
        };
        let mut client = ImagesClient::new(self.channel.clone());
        let stored = client
            .get(self.request(GetImageRequest {
                name: reference.to_string(),
            }))
            .await
            .map_err(rpc("get image", reference))?
            .into_inner()
            .image
            .ok_or_else(|| missing("get image", reference))?;
        let mut digest = stored
            .target
            .map(|target| target.digest)
            .ok_or_else(|| image_err("image has no target".into()))?;

        for _ in 0..MAX_IMAGE_DEPTH {
            let blob = self.read_blob(&digest).await?;
            match image::resolve(&blob, &self.platform).map_err(|e| image_err(e.to_string()))? {
                Resolved::Manifest(next) => digest = next.digest,
                Resolved::Config(config) => {
                    let blob = self.read_blob(&config.digest).await?;
                    let (config, chain_id) =
                        image::parse_config(&blob).map_err(|e| image_err(e.to_string()))?;
                    return Ok(ResolvedImage {
                        name: reference.to_string(),
                        config,
                        chain_id,
                    });
                }
            }
        }
        Err(image_err("image index nests too deeply".into()))
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut client = ContainersClient::new(self.channel.clone());
        let containers = client
            .list(self.request(ListContainersRequest::default()))
            .await
            .map_err(rpc("list containers", "in namespace"))?
            .into_inner()
            .containers;
        Ok(containers.into_iter().map(|c| c.id).collect())
    }

    async fn create_container(&self, new: NewContainer) -> Result<()> {
        let id = new.id.clone();
        let spec = new.spec.to_bytes()?;

        let mut container = Container {
            id: id.clone(),
            image: new.image.clone().unwrap_or_default(),
            runtime: Some(Runtime {
                name: RUNC_RUNTIME.to_string(),
                options: None,
            }),
            ..Default::default()
        };
        container.spec = Some(Default::default());
        if let Some(any) = container.spec.as_mut() {
            any.type_url = SPEC_TYPE_URL.to_string();
            any.value = spec;
        }

        if let Some(parent) = &new.snapshot_parent {
            let mut snapshots = SnapshotsClient::new(self.channel.clone());
            snapshots
                .prepare(self.request(PrepareSnapshotRequest {
                    snapshotter: SNAPSHOTTER.to_string(),
                    key: id.clone(),
                    parent: parent.clone(),
                    ..Default::default()
                }))
                .await
                .map_err(rpc("prepare snapshot", &id))?;
            container.snapshotter = SNAPSHOTTER.to_string();
            container.snapshot_key = id.clone();
        }

        let mut client = ContainersClient::new(self.channel.clone());
        let created = client
            .create(self.request(CreateContainerRequest {
                container: Some(container),
            }))
            .await;
        if let Err(status) = created {
            if new.snapshot_parent.is_some() {
                self.remove_snapshot(&id).await;
            }
            return Err(rpc("create container", &id)(status));
        }
        Ok(())
    }

    async fn create_task(&self, id: &str, io: &TaskIo) -> Result<u32> {
        let rootfs = self.rootfs(id).await?;
        let uri = io.uri();
        let mut client = TasksClient::new(self.channel.clone());
        let created = client
            .create(self.request(CreateTaskRequest {
                container_id: id.to_string(),
                rootfs,
                stdout: uri.clone(),
                stderr: uri,
                ..Default::default()
            }))
            .await
            .map_err(rpc("create task", id))?
            .into_inner();
        Ok(created.pid)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        client
            .start(self.request(StartRequest {
                container_id: id.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(rpc("start task", id))?;
        Ok(())
    }

    async fn wait_task(&self, id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let response = client
            .wait(self.request(WaitRequest {
                container_id: id.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(rpc("wait task", id))?
            .into_inner();
        Ok(response.exit_status)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        match client
            .delete(self.request(DeleteTaskRequest {
                container_id: id.to_string(),
            }))
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(rpc("delete task", id)(status)),
        }
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let deleted = client
            .delete(self.request(DeleteContainerRequest { id: id.to_string() }))
            .await;
        self.remove_snapshot(id).await;
        match deleted {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(rpc("delete container", id)(status)),
        }
    }
}

impl Containerd {
    async fn remove_snapshot(&self, key: &str) {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let removed = client
            .remove(self.request(RemoveSnapshotRequest {
                snapshotter: SNAPSHOTTER.to_string(),
                key: key.to_string(),
            }))
            .await;
        match removed {
            Ok(_) => debug!(key, "removed snapshot"),
            Err(status) if status.code() == Code::NotFound => {}
            Err(status) => warn!(key, error = %status.message(), "failed to remove snapshot"),
        }
    }
}

fn rpc(op: &'static str, target: &str) -> impl FnOnce(Status) -> ControlError {
    let target = target.to_string();
    move |status| ControlError::Runtime {
        op,
        target,
        reason: status.message().to_string(),
        not_found: status.code() == Code::NotFound,
    }
}

fn missing(op: &'static str, target: &str) -> ControlError {
    ControlError::Runtime {
        op,
        target: target.to_string(),
        reason: "not found".to_string(),
        not_found: true,
    }
}
