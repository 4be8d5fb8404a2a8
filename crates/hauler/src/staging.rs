//! Per-ingest staging layouts.
//!
//! A staging layout is a throwaway OCI layout in the temporary directory.
//! Everything one `add` writes lands here first; on commit the blobs are
//! promoted into the real CAS, and the directory is removed when the
//! layout is dropped whether or not the commit happened.

use std::path::Path;

use log::trace;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::artifact::Layer;
use crate::blob::BlobStore;
use crate::descriptor::{Descriptor, ImageIndex};
use crate::digest::Digest;
use crate::error::{Error, IoContext, Result};
use crate::index::INDEX_FILE;
use crate::store::{LAYOUT_FILE, LAYOUT_MARKER};

#[derive(Debug)]
pub(crate) struct StagingLayout {
    dir: TempDir,
    blobs: BlobStore,
}

impl StagingLayout {
    pub(crate) async fn create(tmp_root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(tmp_root)
            .await
            .storage_context(|| format!("creating {}", tmp_root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("hauler-staging-")
            .tempdir_in(tmp_root)
            .storage_context(|| format!("creating staging layout in {}", tmp_root.display()))?;
        tokio::fs::write(dir.path().join(LAYOUT_FILE), LAYOUT_MARKER)
            .await
            .storage_context(|| "writing staging oci-layout")?;
        let blobs = BlobStore::new(dir.path());
        trace!("staging layout at {}", dir.path().display());
        Ok(StagingLayout { dir, blobs })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Stream one layer into the staging CAS.
    pub(crate) async fn write_layer(
        &self,
        layer: &Layer,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        let digest = &layer.descriptor.digest;
        let reader = layer.open().await?;
        let size = self.blobs.write(digest, reader, Some(cancel)).await?;
        if size != layer.descriptor.size {
            return Err(Error::InvalidManifest(format!(
                "blob {digest} is {size} bytes, descriptor says {}",
                layer.descriptor.size
            )));
        }
        Ok(digest.clone())
    }

    pub(crate) async fn write_bytes(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.blobs.write(digest, data, None).await?;
        Ok(())
    }

    /// Record the single descriptor this layout holds.
    pub(crate) async fn write_index(&self, descriptor: &Descriptor) -> Result<()> {
        let mut document = ImageIndex::empty();
        document.manifests.push(descriptor.clone());
        let data = serde_json::to_vec(&document)
            .map_err(|e| Error::storage("serializing staging index", std::io::Error::other(e)))?;
        tokio::fs::write(self.dir.path().join(INDEX_FILE), data)
            .await
            .storage_context(|| "writing staging index")
    }

    /// Move staged blobs into `target`. Digests already present there are skipped.
    pub(crate) async fn promote_into(&self, target: &BlobStore, digests: &[Digest]) -> Result<usize> {
        let mut promoted = 0;
        for digest in digests {
            match target.promote(&self.blobs.path(digest), digest).await {
                Ok(()) => promoted += 1,
                Err(e) if e.is_already_exists() => trace!("{digest} already in store"),
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }
}
