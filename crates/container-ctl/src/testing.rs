//! In-memory runtime and power doubles for controller tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use guest_common::{PowerControl, PowerError};

use crate::error::{ControlError, Result};
use crate::runtime::{ContainerRuntime, ImageConfig, NewContainer, ResolvedImage, TaskIo};

#[derive(Default)]
struct State {
    local_images: BTreeSet<String>,
    remote_images: BTreeSet<String>,
    pulls: Vec<String>,
    containers: BTreeMap<String, NewContainer>,
    created: Vec<NewContainer>,
    snapshots: BTreeSet<String>,
    tasks: BTreeSet<String>,
    task_runs: usize,
    task_io: Vec<TaskIo>,
    exit_status: u32,
    fail_start: bool,
}

/// Tracks containers, snapshots and tasks the way the daemon would.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

fn not_found(op: &'static str, target: &str) -> ControlError {
    ControlError::Runtime {
        op,
        target: target.to_string(),
        reason: "not found".into(),
        not_found: true,
    }
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A runtime whose registry can serve `reference`.
    pub fn with_remote_image(reference: &str) -> Arc<Self> {
        let runtime = Self::new();
        runtime.lock().remote_images.insert(reference.to_string());
        runtime
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_exit_status(&self, status: u32) {
        self.lock().exit_status = status;
    }

    pub fn fail_start(&self) {
        self.lock().fail_start = true;
    }

    /// Simulate a task that survived an unclean shutdown.
    pub fn leave_task(&self, id: &str) {
        self.lock().tasks.insert(id.to_string());
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    pub fn containers(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn created(&self) -> Vec<NewContainer> {
        self.lock().created.clone()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.lock().snapshots.iter().cloned().collect()
    }

    pub fn tasks(&self) -> Vec<String> {
        self.lock().tasks.iter().cloned().collect()
    }

    pub fn task_runs(&self) -> usize {
        self.lock().task_runs
    }

    /// Stdio of every task created, in order.
    pub fn task_io(&self) -> Vec<TaskIo> {
        self.lock().task_io.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self.lock().local_images.iter().cloned().collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.remote_images.contains(reference) {
            return Err(ControlError::Pull {
                reference: reference.to_string(),
                reason: "not found in registry".into(),
            });
        }
        state.pulls.push(reference.to_string());
        state.local_images.insert(reference.to_string());
        Ok(())
    }

    async fn resolve_image(&self, reference: &str) -> Result<ResolvedImage> {
        if !self.lock().local_images.contains(reference) {
            return Err(not_found("get image", reference));
        }
        Ok(ResolvedImage {
            name: reference.to_string(),
            config: ImageConfig {
                cmd: Some(vec!["sh".into()]),
                working_dir: Some("/work".into()),
                ..Default::default()
            },
            chain_id: Some("sha256:layer".into()),
        })
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers())
    }

    async fn create_container(&self, container: NewContainer) -> Result<()> {
        let mut state = self.lock();
        if state.containers.contains_key(&container.id) {
            return Err(ControlError::Runtime {
                op: "create container",
                target: container.id,
                reason: "already exists".into(),
                not_found: false,
            });
        }
        if container.snapshot_parent.is_some() {
            state.snapshots.insert(container.id.clone());
        }
        state.created.push(container.clone());
        state.containers.insert(container.id.clone(), container);
        Ok(())
    }

    async fn create_task(&self, id: &str, io: &TaskIo) -> Result<u32> {
        let mut state = self.lock();
        if !state.containers.contains_key(id) {
            return Err(not_found("create task", id));
        }
        if !state.tasks.insert(id.to_string()) {
            return Err(ControlError::Runtime {
                op: "create task",
                target: id.to_string(),
                reason: "task already exists".into(),
                not_found: false,
            });
        }
        state.task_runs += 1;
        state.task_io.push(io.clone());
        Ok(4000 + u32::try_from(state.task_runs).unwrap_or(0))
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        if self.lock().fail_start {
            return Err(ControlError::Runtime {
                op: "start task",
                target: id.to_string(),
                reason: "exec format error".into(),
                not_found: false,
            });
        }
        Ok(())
    }

    async fn wait_task(&self, _id: &str) -> Result<u32> {
        Ok(self.lock().exit_status)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        self.lock().tasks.remove(id);
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.containers.remove(id);
        state.snapshots.remove(id);
        Ok(())
    }
}

/// Records power calls instead of making them.
#[derive(Default)]
pub struct FakePower {
    calls: Mutex<Vec<&'static str>>,
}

impl FakePower {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl PowerControl for FakePower {
    fn sync(&self) {
        self.calls.lock().unwrap().push("sync");
    }

    fn power_off(&self) -> std::result::Result<(), PowerError> {
        self.calls.lock().unwrap().push("power_off");
        Ok(())
    }
}
