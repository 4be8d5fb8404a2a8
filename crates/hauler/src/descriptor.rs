//! OCI descriptors, manifests and indexes as stored on disk.
//!
//! These are deliberately small serde types rather than full OCI models:
//! the store only needs to walk the blob graph and to write `index.json`
//! with a stable byte representation, so annotations use a `BTreeMap`.
//! Unknown fields in manifests are ignored on read; manifest bytes are
//! always stored verbatim, never re-serialized.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};

/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema 2 manifest.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image config.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Docker image config.
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Helm chart archive layer.
pub const MEDIA_TYPE_CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
/// Helm chart config.
pub const MEDIA_TYPE_CHART_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
/// Arbitrary file layer.
pub const MEDIA_TYPE_FILE_LAYER: &str = "application/vnd.content.hauler.file.layer.v1";
/// File artifact config.
pub const MEDIA_TYPE_FILE_CONFIG: &str = "application/vnd.content.hauler.file.config.v1+json";
/// Cosign simple-signing payload layer.
pub const MEDIA_TYPE_SIMPLE_SIGNING: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
/// In-toto DSSE envelope layer used for attestations.
pub const MEDIA_TYPE_DSSE: &str = "application/vnd.dsse.envelope.v1+json";
/// OCI empty descriptor config.
pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// Annotation holding the reference an artifact is indexed under.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// Annotation holding the artifact kind.
pub const ANNOTATION_KIND: &str = "kind";
/// Annotation holding a layer's file name on extraction.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
/// Annotation holding the URL a file or chart was fetched from.
pub const ANNOTATION_SOURCE: &str = "org.opencontainers.image.source";
/// Annotation on signature-family descriptors naming the artifact they describe.
pub const ANNOTATION_SUBJECT: &str = "dev.hauler/subject";

/// Whether `media_type` is a single-image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    matches!(media_type, MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST)
}

/// Whether `media_type` is a multi-manifest index.
pub fn is_index_media_type(media_type: &str) -> bool {
    matches!(media_type, MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST)
}

/// Platform of an index child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// Architecture variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// OS version.
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
}

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Digest of the referenced blob.
    pub digest: Digest,
    /// Size in bytes of the referenced blob.
    pub size: u64,
    /// Alternate download locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Platform, for index children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Artifact type, for artifact manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// A descriptor for `data` with the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Descriptor {
            media_type: media_type.into(),
            digest: Digest::sha256(data),
            size: data.len() as u64,
            urls: None,
            annotations: BTreeMap::new(),
            platform: None,
            artifact_type: None,
        }
    }

    /// A descriptor for a blob whose digest and size are already known.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Descriptor {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: BTreeMap::new(),
            platform: None,
            artifact_type: None,
        }
    }

    /// Add one annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Look up an annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The indexed reference, from the `ref.name` annotation.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotation(ANNOTATION_REF_NAME)
    }

    /// The kind annotation value.
    pub fn kind_annotation(&self) -> Option<&str> {
        self.annotation(ANNOTATION_KIND)
    }

    /// The file name a layer is extracted under.
    pub fn title(&self) -> Option<&str> {
        self.annotation(ANNOTATION_TITLE)
    }
}

/// An image (or artifact) manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    pub schema_version: u32,
    /// Manifest media type; optional in the OCI format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// The config blob.
    pub config: Descriptor,
    /// Payload blobs, in order.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// The manifest this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Manifest annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// An OCI manifest over `config` and `layers`.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            artifact_type: None,
            config,
            layers,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Serialize to the bytes that get stored and digested.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidManifest(e.to_string()))
    }
}

/// An image index or manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Index media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Child manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// Index annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// An empty OCI index.
    pub fn empty() -> Self {
        ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// A parsed manifest document of either shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    /// A single manifest.
    Manifest(Manifest),
    /// An index of manifests.
    Index(ImageIndex),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Probe {
    schema_version: Option<u32>,
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
    config: Option<serde_json::Value>,
}

impl ManifestDocument {
    /// Parse `data`, using `media_type` (typically a `Content-Type` header
    /// or descriptor media type) when the document does not declare one.
    pub fn parse(data: &[u8], media_type: Option<&str>) -> Result<Self> {
        let probe: Probe =
            serde_json::from_slice(data).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        if probe.schema_version != Some(2) {
            return Err(Error::InvalidManifest(format!(
                "unsupported schemaVersion {:?}",
                probe.schema_version
            )));
        }
        let declared = probe.media_type.as_deref().or(media_type);
        let is_index = match declared {
            Some(mt) if is_index_media_type(mt) => true,
            Some(mt) if is_manifest_media_type(mt) => false,
            _ => probe.manifests.is_some() && probe.config.is_none(),
        };
        if let (Some(inner), Some(outer)) = (probe.media_type.as_deref(), media_type) {
            if (is_index_media_type(inner) || is_manifest_media_type(inner))
                && (is_index_media_type(outer) || is_manifest_media_type(outer))
                && inner != outer
            {
                return Err(Error::InvalidManifest(format!(
                    "media type {outer} does not match document type {inner}"
                )));
            }
        }
        if is_index {
            serde_json::from_slice(data)
                .map(ManifestDocument::Index)
                .map_err(|e| Error::InvalidManifest(e.to_string()))
        } else {
            serde_json::from_slice(data)
                .map(ManifestDocument::Manifest)
                .map_err(|e| Error::InvalidManifest(e.to_string()))
        }
    }

    /// Media type declared by the document, falling back to `default`.
    pub fn media_type<'a>(&'a self, default: &'a str) -> &'a str {
        let declared = match self {
            ManifestDocument::Manifest(m) => m.media_type.as_deref(),
            ManifestDocument::Index(i) => i.media_type.as_deref(),
        };
        declared.unwrap_or(default)
    }

    /// Every descriptor this document points at directly.
    pub fn children(&self) -> Vec<&Descriptor> {
        match self {
            ManifestDocument::Manifest(m) => std::iter::once(&m.config).chain(&m.layers).collect(),
            ManifestDocument::Index(i) => i.manifests.iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json_shape() {
        let desc = Descriptor::for_bytes(MEDIA_TYPE_FILE_LAYER, b"hello")
            .with_annotation(ANNOTATION_TITLE, "hello.txt")
            .with_annotation(ANNOTATION_REF_NAME, "hauler/hello.txt:latest");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(
            json,
            format!(
                r#"{{"mediaType":"{MEDIA_TYPE_FILE_LAYER}","digest":"{}","size":5,"annotations":{{"org.opencontainers.image.ref.name":"hauler/hello.txt:latest","org.opencontainers.image.title":"hello.txt"}}}}"#,
                Digest::sha256(b"hello")
            )
        );
        assert_eq!(desc.title(), Some("hello.txt"));
        assert_eq!(desc.ref_name(), Some("hauler/hello.txt:latest"));
    }

    #[test]
    fn test_parse_manifest_and_index() {
        let config = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, b"{}");
        let layer = Descriptor::for_bytes("application/vnd.oci.image.layer.v1.tar", b"layer");
        let manifest = Manifest::new(config.clone(), vec![layer.clone()]);
        let bytes = manifest.to_bytes().unwrap();

        let doc = ManifestDocument::parse(&bytes, None).unwrap();
        assert_eq!(doc.media_type("x"), MEDIA_TYPE_OCI_MANIFEST);
        assert_eq!(doc.children(), vec![&config, &layer]);

        let mut index = ImageIndex::empty();
        index
            .manifests
            .push(Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &bytes));
        let index_bytes = serde_json::to_vec(&index).unwrap();
        let doc = ManifestDocument::parse(&index_bytes, None).unwrap();
        assert!(matches!(doc, ManifestDocument::Index(_)));
        assert_eq!(doc.children().len(), 1);
    }

    #[test]
    fn test_parse_docker_manifest_without_declared_type() {
        let config = Descriptor::for_bytes(MEDIA_TYPE_DOCKER_CONFIG, b"{}");
        let body = serde_json::json!({
            "schemaVersion": 2,
            "config": config,
            "layers": [],
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let doc = ManifestDocument::parse(&bytes, Some(MEDIA_TYPE_DOCKER_MANIFEST)).unwrap();
        assert_eq!(doc.media_type(MEDIA_TYPE_DOCKER_MANIFEST), MEDIA_TYPE_DOCKER_MANIFEST);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ManifestDocument::parse(b"not json", None).is_err());
        assert!(ManifestDocument::parse(br#"{"schemaVersion":1}"#, None).is_err());
        assert!(ManifestDocument::parse(br#"{"schemaVersion":2}"#, None).is_err());
        let manifest = Manifest::new(Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, b"{}"), vec![]);
        let bytes = manifest.to_bytes().unwrap();
        assert!(ManifestDocument::parse(&bytes, Some(MEDIA_TYPE_OCI_INDEX)).is_err());
    }
}
