//! The manifest + config + layers triple every builder produces.
//!
//! Layer bytes are not held in memory: each [`Layer`] carries an
//! [`Opener`] that yields a fresh reader on demand, so a store can pull
//! layers lazily and a retrying opener can restart a failed download.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::descriptor::{Descriptor, Manifest, ManifestDocument};
use crate::digest::{Algorithm, Digest};
use crate::error::{Error, IoContext, Result};
use crate::kind::Kind;

/// A boxed byte stream.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Produces a reader over one blob's bytes.
#[async_trait]
pub trait Opener: Send + Sync + fmt::Debug {
    /// Open a new reader positioned at the start of the blob.
    async fn open(&self) -> Result<BlobReader>;
}

/// Opener over bytes already in memory.
#[derive(Clone)]
pub struct BytesOpener(Bytes);

impl fmt::Debug for BytesOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BytesOpener").field(&self.0.len()).finish()
    }
}

impl BytesOpener {
    /// Serve `data` on every open.
    pub fn new(data: impl Into<Bytes>) -> Self {
        BytesOpener(data.into())
    }
}

#[async_trait]
impl Opener for BytesOpener {
    async fn open(&self) -> Result<BlobReader> {
        Ok(Box::pin(std::io::Cursor::new(self.0.clone())))
    }
}

/// Opener over a local file.
#[derive(Debug, Clone)]
pub struct FileOpener(PathBuf);

impl FileOpener {
    /// Open `path` on demand.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileOpener(path.into())
    }
}

#[async_trait]
impl Opener for FileOpener {
    async fn open(&self) -> Result<BlobReader> {
        let file = tokio::fs::File::open(&self.0)
            .await
            .storage_context(|| format!("opening {}", self.0.display()))?;
        Ok(Box::pin(file))
    }
}

/// One blob of an artifact: its descriptor and how to read it.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Descriptor as it appears in the manifest.
    pub descriptor: Descriptor,
    opener: Arc<dyn Opener>,
}

impl Layer {
    /// A layer read through `opener`.
    pub fn new(descriptor: Descriptor, opener: impl Opener + 'static) -> Self {
        Layer {
            descriptor,
            opener: Arc::new(opener),
        }
    }

    /// A layer whose bytes are in memory; the descriptor is computed.
    pub fn from_bytes(media_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Layer {
            descriptor: Descriptor::for_bytes(media_type, &data),
            opener: Arc::new(BytesOpener(data)),
        }
    }

    /// A layer backed by a local file, hashed up front.
    pub async fn from_file(path: &Path, media_type: impl Into<String>) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .storage_context(|| format!("opening {}", path.display()))?;
        let (digest, size) = crate::blob::hash_reader(Algorithm::Sha256, file, None).await?;
        Ok(Layer::new(
            Descriptor::new(media_type, digest, size),
            FileOpener::new(path),
        ))
    }

    /// Add an annotation to the layer descriptor.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.annotations.insert(key.into(), value.into());
        self
    }

    /// Open a reader over the layer bytes.
    pub async fn open(&self) -> Result<BlobReader> {
        self.opener.open().await
    }
}

/// A buildable artifact: manifest bytes plus the blobs they reference.
///
/// For an image index, `layers` carries the child manifests together with
/// their configs and layers, so that every blob the index reaches is stored.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Media type of the manifest.
    pub media_type: String,
    /// Manifest bytes, stored verbatim.
    pub manifest: Bytes,
    /// Algorithm for the manifest digest.
    pub algorithm: Algorithm,
    /// Config blob, if the manifest has one.
    pub config: Option<Layer>,
    /// Every other blob.
    pub layers: Vec<Layer>,
    /// Explicit kind; derived from media types when absent.
    pub kind: Option<Kind>,
    /// Extra annotations for the index descriptor.
    pub annotations: BTreeMap<String, String>,
}

impl Artifact {
    /// An artifact around verbatim manifest bytes.
    pub fn new(media_type: impl Into<String>, manifest: impl Into<Bytes>) -> Self {
        Artifact {
            media_type: media_type.into(),
            manifest: manifest.into(),
            algorithm: Algorithm::Sha256,
            config: None,
            layers: Vec::new(),
            kind: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Serialize `manifest` and pair it with its config bytes and layers.
    pub fn from_manifest(manifest: &Manifest, config: Bytes, layers: Vec<Layer>) -> Result<Self> {
        let media_type = manifest
            .media_type
            .clone()
            .ok_or_else(|| Error::InvalidManifest("manifest has no mediaType".into()))?;
        let config = Layer {
            descriptor: manifest.config.clone(),
            opener: Arc::new(BytesOpener(config)),
        };
        Ok(Artifact::new(media_type, manifest.to_bytes()?)
            .with_config(config)
            .with_layers(layers))
    }

    /// Set the config blob.
    pub fn with_config(mut self, config: Layer) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the layer list.
    pub fn with_layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = layers;
        self
    }

    /// Set the kind explicitly.
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Hash the manifest with `algorithm` instead of sha256.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Add an annotation to the index descriptor.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Digest of the manifest bytes.
    pub fn digest(&self) -> Digest {
        Digest::compute(self.algorithm, &self.manifest)
    }

    /// The explicit kind, or one derived from the manifest's media types.
    pub fn kind(&self) -> Kind {
        if let Some(kind) = self.kind {
            return kind;
        }
        match ManifestDocument::parse(&self.manifest, Some(&self.media_type)) {
            Ok(ManifestDocument::Manifest(m)) => {
                let layer_types: Vec<&str> = m.layers.iter().map(|l| l.media_type.as_str()).collect();
                Kind::from_media_types(&self.media_type, Some(&m.config.media_type), &layer_types)
            }
            Ok(ManifestDocument::Index(_)) => Kind::ImageIndex,
            Err(_) => Kind::from_media_types(&self.media_type, None, &[]),
        }
    }

    /// Config followed by layers.
    pub fn blobs(&self) -> impl Iterator<Item = &Layer> {
        self.config.iter().chain(&self.layers)
    }
}
