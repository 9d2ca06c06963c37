//! Container lifecycle control.
//!
//! [`Controller`] runs containers through a [`ContainerRuntime`], the real
//! one being [`Containerd`]. Two kinds of container exist:
//!
//! - directive containers, created from a fresh image snapshot, run once and
//!   deleted ([`Controller::run_from_directive`]);
//! - persistent containers, declared by JSON files, created once and reused
//!   on every restart ([`ContainerService`]).

mod containerd;
mod controller;
mod error;
pub mod image;
mod persistent;
mod runtime;
pub mod spec;

#[cfg(test)]
mod testing;

pub use containerd::{Containerd, DEFAULT_NAMESPACE, DEFAULT_SOCKET, RUNC_RUNTIME, SNAPSHOTTER};
pub use controller::{Controller, SpecSettings, apply_exit_policy, new_container_id};
pub use error::{ControlError, Result};
pub use persistent::{
    ContainerService, PersistentContainerSpec, PersistentSpecs, load_persistent_specs,
};
pub use runtime::{ContainerRuntime, ImageConfig, NewContainer, ResolvedImage, TaskIo};
