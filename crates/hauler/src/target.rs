//! Destinations for [`Store::copy`](crate::store::Store::copy).

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use crate::artifact::BlobReader;
use crate::descriptor::Descriptor;
use crate::error::{Error, IoContext, Result};
use crate::reference::Reference;

/// A sink that accepts blobs and manifests.
///
/// The store calls `put_blob` for every blob an entry reaches (once per
/// digest and destination repository per copy), then `put_manifest` for the entry itself. Index
/// children are sent as manifests pinned by digest before their parent.
#[async_trait]
pub trait Target: Send + Sync + fmt::Debug {
    /// Translate a stored reference into the reference used at the target.
    fn rewrite(&self, reference: &Reference) -> Result<Reference> {
        Ok(reference.clone())
    }

    /// Whether the target already holds this blob.
    async fn blob_exists(&self, _reference: &Reference, _descriptor: &Descriptor) -> Result<bool> {
        Ok(false)
    }

    /// Store one blob.
    async fn put_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        reader: BlobReader,
    ) -> Result<()>;

    /// Store a manifest under `reference`.
    async fn put_manifest(&self, reference: &Reference, manifest: &[u8], media_type: &str)
        -> Result<()>;
}

/// Writes titled layers (files, charts) into a flat directory.
///
/// Blobs without an `org.opencontainers.image.title` annotation and all
/// manifests are ignored, which yields the layout a static file server
/// expects.
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    dir: PathBuf,
}

impl DirectoryTarget {
    /// Target the directory `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectoryTarget { dir: dir.into() }
    }

    /// Destination directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a blob with `title` ends up, rejecting anything but a plain name.
    pub fn destination(&self, title: &str) -> Result<PathBuf> {
        let mut components = Path::new(title).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.dir.join(name)),
            _ => Err(Error::UnsafePath(PathBuf::from(title))),
        }
    }
}

#[async_trait]
impl Target for DirectoryTarget {
    async fn blob_exists(&self, _reference: &Reference, descriptor: &Descriptor) -> Result<bool> {
        let Some(title) = descriptor.title() else {
            return Ok(false);
        };
        let dest = self.destination(title)?;
        Ok(tokio::fs::metadata(&dest)
            .await
            .map(|m| m.len() == descriptor.size)
            .unwrap_or(false))
    }

    async fn put_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        mut reader: BlobReader,
    ) -> Result<()> {
        let Some(title) = descriptor.title() else {
            debug!("{reference}: skipping untitled blob {}", descriptor.digest);
            return Ok(());
        };
        let dest = self.destination(title)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .storage_context(|| format!("creating {}", self.dir.display()))?;
        let tmp = self
            .dir
            .join(format!(".{title}.tmp-{}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .storage_context(|| format!("creating {}", tmp.display()))?;
            tokio::io::copy(&mut reader, &mut file)
                .await
                .storage_context(|| format!("writing {}", tmp.display()))?;
            file.flush()
                .await
                .storage_context(|| format!("flushing {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &dest)
                .await
                .storage_context(|| format!("renaming into {}", dest.display()))
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result?;
        info!("{reference}: wrote {}", dest.display());
        Ok(())
    }

    async fn put_manifest(
        &self,
        _reference: &Reference,
        _manifest: &[u8],
        _media_type: &str,
    ) -> Result<()> {
        Ok(())
    }
}
