//! Long-lived containers declared by JSON files and run under supervision.
//!
//! ```json
//! {
//!   "ID": "node-agent",
//!   "Delay": "5s",
//!   "WithNetHost": true,
//!   "Mounts": [{"Destination": "/data", "Type": "bind", "Source": "/var/data", "Options": ["rbind"]}],
//!   "OCISpec": {"root": {"path": "/opt/agent"}, "process": {"args": ["/bin/agent"]}}
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use supervisor::{Service, ServiceError};
use tracing::{info, warn};

use crate::controller::{Controller, SpecSettings};
use crate::error::{ControlError, Result};
use crate::spec::Mount;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PersistentContainerSpec {
    #[serde(rename = "ID")]
    pub id: String,
    /// Pause before every start.
    #[serde(default, deserialize_with = "delay")]
    pub delay: Option<Duration>,
    /// `OCISpec` is the whole spec rather than a fragment over the defaults.
    #[serde(default)]
    pub full_spec: bool,
    #[serde(default)]
    pub with_privileged: bool,
    #[serde(default)]
    pub with_all_devices_allowed: bool,
    #[serde(default)]
    pub with_host_devices: bool,
    #[serde(default)]
    pub with_net_host: bool,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(rename = "OCISpec", default)]
    pub oci_spec: Option<Value>,
}

impl PersistentContainerSpec {
    pub fn settings(&self) -> Result<SpecSettings> {
        let fragment = match &self.oci_spec {
            Some(Value::Null) | None => String::new(),
            Some(spec) => {
                serde_json::to_string(spec).map_err(|e| ControlError::Spec(e.to_string()))?
            }
        };
        Ok(SpecSettings {
            fragment,
            replace: self.full_spec,
            mounts: self.mounts.clone(),
            host_network: self.with_net_host,
            privileged: self.with_privileged,
            all_devices_allowed: self.with_all_devices_allowed,
            host_devices: self.with_host_devices,
        })
    }
}

/// A duration string (`"1m30s"`) or integer nanoseconds.
fn delay<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Nanos(0)) => Ok(None),
        Some(Raw::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos))),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => guest_common::parse_duration(text.trim())
            .map(|d| (!d.is_zero()).then_some(d))
            .map_err(serde::de::Error::custom),
    }
}

/// Persistent specs found in a directory, plus the files that were skipped.
#[derive(Debug, Default)]
pub struct PersistentSpecs {
    pub specs: Vec<PersistentContainerSpec>,
    pub skipped: Vec<ControlError>,
}

/// Read every `*.json` file in `dir`, in file name order.
///
/// A missing directory means no persistent containers. Files that do not
/// parse, have no ID, or repeat an earlier ID are skipped.
pub fn load_persistent_specs(dir: &Path) -> Result<PersistentSpecs> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PersistentSpecs::default()),
        Err(source) => {
            return Err(ControlError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut loaded = PersistentSpecs::default();
    let mut seen = HashSet::new();
    for path in paths {
        match read_spec(&path) {
            Ok(spec) if !seen.insert(spec.id.clone()) => {
                let err = ControlError::Descriptor {
                    path: path.clone(),
                    reason: format!("duplicate ID {:?}", spec.id),
                };
                warn!(error = %err, "skipping container descriptor");
                loaded.skipped.push(err);
            }
            Ok(spec) => {
                info!(container = %spec.id, path = %path.display(), "loaded container descriptor");
                loaded.specs.push(spec);
            }
            Err(err) => {
                warn!(error = %err, "skipping container descriptor");
                loaded.skipped.push(err);
            }
        }
    }
    Ok(loaded)
}

fn read_spec(path: &Path) -> Result<PersistentContainerSpec> {
    let malformed = |reason: String| ControlError::Descriptor {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| malformed(e.to_string()))?;
    let spec: PersistentContainerSpec =
        serde_json::from_slice(&bytes).map_err(|e| malformed(e.to_string()))?;
    if spec.id.trim().is_empty() {
        return Err(malformed("empty ID".into()));
    }
    if let Some(other) = spec.oci_spec.as_ref().filter(|v| !v.is_object() && !v.is_null()) {
        return Err(malformed(format!("OCISpec must be an object, got {other}")));
    }
    Ok(spec)
}

/// A persistent container as a supervised service.
pub struct ContainerService {
    controller: Arc<Controller>,
    spec: PersistentContainerSpec,
}

impl ContainerService {
    pub fn new(controller: Arc<Controller>, spec: PersistentContainerSpec) -> Self {
        ContainerService { controller, spec }
    }
}

#[async_trait]
impl Service for ContainerService {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn delay(&self) -> Option<Duration> {
        self.spec.delay
    }

    async fn run(&self) -> std::result::Result<Option<i32>, ServiceError> {
        match self.controller.run_from_persistent_spec(&self.spec).await {
            Ok(status) => Ok(i32::try_from(status).ok()),
            Err(e) => Err(ServiceError::Failed {
                name: self.spec.id.clone(),
                source: Box::new(e),
            }),
        }
    }
}
