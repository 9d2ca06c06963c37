//! The instruction published through instance metadata attributes.
//!
//! ```json
//! {
//!   "container-ref": "docker.io/library/busybox:latest",
//!   "container-spec": "{\"process\":{\"args\":[\"echo\",\"hi\"]}}",
//!   "overwrite-defaults": "false",
//!   "stop-on-exit": "true"
//! }
//! ```
//!
//! Metadata attributes are strings, so the flags arrive as `"true"` /
//! `"false"`. Other attributes in the same document are ignored.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::WatchError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerDirective {
    /// Image reference to run. Empty means "nothing to run".
    #[serde(rename = "container-ref", default)]
    pub reference: String,

    /// Raw OCI runtime spec fragment (JSON text).
    #[serde(rename = "container-spec", default, deserialize_with = "spec_text")]
    pub spec: String,

    /// Replace the default spec instead of merging into it.
    #[serde(rename = "overwrite-defaults", default, deserialize_with = "flag")]
    pub overwrite_defaults: bool,

    /// Power the machine off once the container exits.
    #[serde(rename = "stop-on-exit", default, deserialize_with = "flag")]
    pub stop_on_exit: bool,
}

impl ContainerDirective {
    pub fn from_json(body: &[u8]) -> Result<Self, WatchError> {
        serde_json::from_slice(body).map_err(WatchError::Malformed)
    }

    pub fn has_container(&self) -> bool {
        !self.reference.trim().is_empty()
    }
}

/// Accepts the spellings Go's `strconv.ParseBool` accepts, or a JSON bool.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.trim() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean {other:?}"
            ))),
        },
    }
}

/// The spec is normally a JSON string; an inline object is re-serialised.
fn spec_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}
