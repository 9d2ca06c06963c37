//! OCI and Docker image metadata: index, manifest, and config blobs.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::runtime::ImageConfig;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform this binary runs on, in OCI naming.
    pub fn current() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Platform {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    fn matches(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

/// An index or a manifest; which one is decided by the media type or by
/// which fields are present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    config: Option<Descriptor>,
}

/// What a fetched top-level blob turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// An index: follow this platform-matching manifest next.
    Manifest(Descriptor),
    /// A manifest: this is its config blob.
    Config(Descriptor),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ImageFormatError {
    #[error("malformed image document: {0}")]
    Malformed(String),
    #[error("no manifest for {os}/{architecture}")]
    NoPlatform { os: String, architecture: String },
    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),
}

/// Step from an index or manifest blob towards the image config.
pub fn resolve(blob: &[u8], platform: &Platform) -> Result<Resolved, ImageFormatError> {
    let doc: Document =
        serde_json::from_slice(blob).map_err(|e| ImageFormatError::Malformed(e.to_string()))?;
    let is_index = match doc.media_type.as_deref() {
        Some(MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_LIST) => true,
        Some(MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST) => false,
        Some(other) if !other.is_empty() => {
            return Err(ImageFormatError::UnsupportedMediaType(other.to_string()));
        }
        _ => doc.manifests.is_some(),
    };

    if is_index {
        let manifests = doc.manifests.unwrap_or_default();
        return manifests
            .into_iter()
            .find(|m| m.platform.as_ref().is_some_and(|p| p.matches(platform)))
            .map(Resolved::Manifest)
            .ok_or_else(|| ImageFormatError::NoPlatform {
                os: platform.os.clone(),
                architecture: platform.architecture.clone(),
            });
    }
    doc.config
        .map(Resolved::Config)
        .ok_or_else(|| ImageFormatError::Malformed("manifest has no config".into()))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: Option<ImageConfig>,
    #[serde(default)]
    rootfs: Option<RootFs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Runtime config and layer chain ID from an image config blob.
pub fn parse_config(blob: &[u8]) -> Result<(ImageConfig, Option<String>), ImageFormatError> {
    let parsed: ConfigBlob =
        serde_json::from_slice(blob).map_err(|e| ImageFormatError::Malformed(e.to_string()))?;
    let diff_ids = parsed.rootfs.map(|r| r.diff_ids).unwrap_or_default();
    Ok((parsed.config.unwrap_or_default(), chain_id(&diff_ids)))
}

/// Identity of a stack of layers: the first diff ID, then
/// `sha256(parent + " " + diff)` for each layer above it.
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let mut layers = diff_ids.iter();
    let first = layers.next()?.clone();
    Some(layers.fold(first, |parent, diff| {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        hasher.update(b" ");
        hasher.update(diff.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }))
}
