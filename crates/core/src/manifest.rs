//! Parsing of manifest documents and image configuration blobs.
//!
//! Both Docker schema2 and OCI media types are supported. A manifest is
//! either an *image manifest* (config blob + layer blobs) or an *index*
//! (a list of child manifests, usually one per platform).

use crate::digest::Digest;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Media type constants used throughout the registry.
pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
}

/// Media types that `ParsedManifest::parse` accepts.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    media_types::DOCKER_MANIFEST,
    media_types::DOCKER_MANIFEST_LIST,
    media_types::OCI_MANIFEST,
    media_types::OCI_INDEX,
];

pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == media_types::DOCKER_MANIFEST_LIST || media_type == media_types::OCI_INDEX
}

pub fn is_image_config_media_type(media_type: &str) -> bool {
    media_type == media_types::DOCKER_IMAGE_CONFIG || media_type == media_types::OCI_IMAGE_CONFIG
}

/// A content descriptor: a reference from a manifest to another object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform selector attached to index entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// An image manifest: one config blob plus an ordered list of layer blobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// An image index (a.k.a. manifest list): child manifests per platform.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// A parsed and structurally validated manifest document.
#[derive(Clone, Debug)]
pub enum ParsedManifest {
    Image(ImageManifest),
    Index(ManifestIndex),
}

impl ParsedManifest {
    /// Parse manifest bytes according to their declared media type.
    ///
    /// A `mediaType` field inside the payload that contradicts the declared
    /// media type is rejected; a missing field is tolerated (Docker schema2
    /// payloads in the wild often omit it).
    pub fn parse(media_type: &str, bytes: &[u8]) -> Result<Self> {
        if !ACCEPTED_MANIFEST_MEDIA_TYPES.contains(&media_type) {
            return Err(Error::ManifestParse(format!(
                "unsupported manifest media type: {media_type}"
            )));
        }
        let parsed = if is_index_media_type(media_type) {
            let index: ManifestIndex =
                serde_json::from_slice(bytes).map_err(|e| Error::ManifestParse(e.to_string()))?;
            if index.manifests.is_empty() {
                return Err(Error::ManifestParse("index contains no manifests".into()));
            }
            Self::Index(index)
        } else {
            let manifest: ImageManifest =
                serde_json::from_slice(bytes).map_err(|e| Error::ManifestParse(e.to_string()))?;
            Self::Image(manifest)
        };
        if let Some(embedded) = parsed.embedded_media_type() {
            if embedded != media_type {
                return Err(Error::ManifestParse(format!(
                    "declared media type {media_type} does not match payload media type {embedded}"
                )));
            }
        }
        Ok(parsed)
    }

    fn embedded_media_type(&self) -> Option<&str> {
        match self {
            Self::Image(m) => m.media_type.as_deref(),
            Self::Index(i) => i.media_type.as_deref(),
        }
    }

    /// All blob references of this manifest (config first, then layers).
    /// Indexes reference no blobs directly.
    pub fn blob_references(&self) -> Vec<&Descriptor> {
        match self {
            Self::Image(m) => {
                let mut refs = Vec::with_capacity(m.layers.len() + 1);
                refs.push(&m.config);
                refs.extend(m.layers.iter());
                refs
            }
            Self::Index(_) => Vec::new(),
        }
    }

    /// All child manifest references (empty for image manifests).
    pub fn child_manifests(&self) -> &[Descriptor] {
        match self {
            Self::Image(_) => &[],
            Self::Index(i) => &i.manifests,
        }
    }
}

/// The subset of an image configuration blob that the registry inspects:
/// creation timestamps (for GC time constraints) and labels (for required
/// label checks and label-matching GC policies).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
}

impl ImageConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default()
    }

    /// The earliest and latest layer creation timestamps, including the
    /// image creation timestamp itself.
    pub fn layer_timestamps(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let mut min = None;
        let mut max = None;
        let timestamps = self
            .history
            .iter()
            .filter_map(|h| h.created)
            .chain(self.created);
        for ts in timestamps {
            min = Some(match min {
                Some(m) if m < ts => m,
                _ => ts,
            });
            max = Some(match max {
                Some(m) if m > ts => m,
                _ => ts,
            });
        }
        (min, max)
    }
}

/// An account's platform filter: when non-empty, only index entries whose
/// platform is listed get replicated into the account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformFilter(pub Vec<Platform>);

impl PlatformFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the given descriptor passes this filter. Descriptors without
    /// platform information always pass; an empty filter passes everything.
    pub fn includes(&self, descriptor: &Descriptor) -> bool {
        match &descriptor.platform {
            None => true,
            Some(platform) => self.0.is_empty() || self.0.contains(platform),
        }
    }
}
