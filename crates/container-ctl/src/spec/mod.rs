//! OCI runtime spec composition.
//!
//! A spec is held as a JSON document. Every change is a [`SpecOpt`]: a pure
//! `Spec -> Result<Spec>` transform. [`build_spec`] plans the transforms for
//! a request in a fixed order and folds them left to right.

mod defaults;
pub mod devices;
mod opts;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ControlError, Result};
use crate::runtime::ImageConfig;

pub use defaults::{ALL_CAPABILITIES, DEFAULT_CAPABILITIES, DEFAULT_PATH_ENV, default_spec};
pub use devices::Device;
pub use opts::SpecOpt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Spec(Value);

impl Spec {
    /// A spec with nothing set.
    pub fn empty() -> Self {
        Spec(Value::Object(Map::new()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Value at a JSON pointer such as `/process/cwd`.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| ControlError::Spec(e.to_string()))
    }

    /// Object at `path`, created (replacing any non-object) if needed.
    pub(crate) fn object_mut(&mut self, path: &[&str]) -> Option<&mut Map<String, Value>> {
        let mut current = &mut self.0;
        for key in path {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = current
                .as_object_mut()?
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current.as_object_mut()
    }

    /// Array at `path`, created (replacing any non-array) if needed.
    pub(crate) fn array_mut(&mut self, path: &[&str]) -> Option<&mut Vec<Value>> {
        let (last, parents) = path.split_last()?;
        let slot = self
            .object_mut(parents)?
            .entry(last.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        slot.as_array_mut()
    }

    /// Remove the key at the end of `path`, if present.
    pub(crate) fn remove(&mut self, path: &[&str]) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.0;
        for key in parents {
            match current.get_mut(*key) {
                Some(next) => current = next,
                None => return,
            }
        }
        if let Value::Object(map) = current {
            map.remove(*last);
        }
    }
}

/// Merge `fragment` into `target`: objects merge key by key, a `null`
/// removes the key, anything else (arrays included) replaces.
pub fn merge(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target), Value::Object(fragment)) => {
            for (key, value) in fragment {
                if value.is_null() {
                    target.remove(key);
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value);
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, fragment) => *target = fragment.clone(),
    }
}

/// A bind or filesystem mount to add to the spec.
///
/// Reads both the OCI spelling and the capitalised one used by container
/// descriptor files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(alias = "Destination")]
    pub destination: String,
    #[serde(
        rename = "type",
        alias = "Type",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kind: String,
    #[serde(alias = "Source", default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(alias = "Options", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Capability switches layered over the merged spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    pub host_network: bool,
    pub privileged: bool,
    pub all_devices_allowed: bool,
    /// Host devices to expose, scanned by the caller. `None` leaves the
    /// device list alone.
    pub host_devices: Option<Vec<Device>>,
}

/// Where the container lives, for defaults that embed it.
#[derive(Debug, Clone)]
pub struct SpecContext<'a> {
    pub namespace: &'a str,
    pub id: &'a str,
}

/// Inputs to [`build_spec`].
#[derive(Debug, Clone, Default)]
pub struct SpecRequest<'a> {
    /// Image configuration to seed process defaults from.
    pub image: Option<&'a ImageConfig>,
    /// Raw JSON spec fragment; empty means none.
    pub fragment: &'a str,
    /// Start from an empty spec instead of the defaults.
    pub replace: bool,
    pub mounts: Vec<Mount>,
    pub flags: Flags,
}

/// The ordered transforms for `request`. Flags always come last so the
/// fragment cannot undo them.
pub fn plan(request: &SpecRequest<'_>) -> Result<Vec<SpecOpt>> {
    let mut opts = Vec::new();
    if let (false, Some(image)) = (request.replace, request.image) {
        opts.push(SpecOpt::ImageConfig(image.clone()));
    }
    let fragment = request.fragment.trim();
    if !fragment.is_empty() {
        let value: Value = serde_json::from_str(fragment)
            .map_err(|e| ControlError::Spec(format!("fragment is not valid JSON: {e}")))?;
        if !value.is_object() {
            return Err(ControlError::Spec("fragment must be a JSON object".into()));
        }
        opts.push(SpecOpt::Fragment(value));
    }
    if !request.mounts.is_empty() {
        opts.push(SpecOpt::Mounts(request.mounts.clone()));
    }
    let flags = &request.flags;
    if flags.host_network {
        opts.push(SpecOpt::HostNetwork);
    }
    if flags.privileged {
        opts.push(SpecOpt::Privileged);
    }
    if flags.all_devices_allowed {
        opts.push(SpecOpt::AllDevicesAllowed);
    }
    if let Some(devices) = &flags.host_devices {
        opts.push(SpecOpt::HostDevices(devices.clone()));
    }
    Ok(opts)
}

/// Compose the spec for one container.
pub fn build_spec(ctx: &SpecContext<'_>, request: &SpecRequest<'_>) -> Result<Spec> {
    let base = if request.replace {
        Spec::empty()
    } else {
        default_spec(ctx.namespace, ctx.id)
    };
    plan(request)?
        .into_iter()
        .try_fold(base, |spec, opt| opt.apply(spec))
}
