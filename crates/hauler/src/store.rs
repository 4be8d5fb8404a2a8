//! The content store.
//!
//! A store is one OCI image layout on disk:
//!
//! ```text
//! <root>/
//!   oci-layout            {"imageLayoutVersion":"1.0.0"}
//!   index.json            sorted descriptors, one per (digest, ref.name, kind)
//!   blobs/
//!     sha256/<hex>        content-addressed blobs
//!     sha512/<hex>
//!   uploads/<uuid>        in-progress registry uploads
//! ```
//!
//! Every ingest goes through a staging layout under the temporary directory
//! and is committed by promoting its blobs into `blobs/` and upserting one
//! descriptor into `index.json`. Mutations take the store guard exclusively
//! and reads share it, so readers never observe a half-committed ingest.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, UnpackOptions};
use crate::artifact::{Artifact, Layer};
use crate::blob::BlobStore;
use crate::config::StoreConfig;
use crate::descriptor::{
    is_index_media_type, is_manifest_media_type, Descriptor, ManifestDocument,
    ANNOTATION_KIND, ANNOTATION_REF_NAME, ANNOTATION_SUBJECT, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::digest::Digest;
use crate::error::{Error, IoContext, Result, MANIFEST_BLOB_UNKNOWN};
use crate::index::Index;
use crate::kind::{parse_cosign_tag, Kind};
use crate::reference::Reference;
use crate::staging::StagingLayout;
use crate::target::{DirectoryTarget, Target};
use crate::upload::{upload_monolithic, UploadSession, Uploads};

/// File marking a directory as an OCI layout.
pub const LAYOUT_FILE: &str = "oci-layout";

/// Contents of [`LAYOUT_FILE`].
pub const LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// How many layers of one artifact are fetched at once.
const LAYER_CONCURRENCY: usize = 4;

/// Outcome of [`Store::gc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Number of blobs deleted.
    pub blobs_removed: u64,
    /// Total size of the deleted blobs.
    pub bytes_removed: u64,
}

/// Outcome of [`Store::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// These descriptors were dropped from the index.
    Removed(Vec<Descriptor>),
    /// Several entries matched and `force` was not given; nothing was removed.
    NeedsConfirmation(Vec<Descriptor>),
}

/// Counters from [`Store::copy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Manifests sent, index children included.
    pub manifests: usize,
    /// Blobs sent.
    pub blobs_copied: usize,
    /// Blobs the target already had.
    pub blobs_skipped: usize,
}

/// Findings of [`Store::fsck`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Blobs hashed.
    pub checked: usize,
    /// Blobs whose contents do not hash to their name.
    pub corrupt: Vec<Digest>,
    /// Digests reachable from the index but absent from the CAS.
    pub missing: Vec<Digest>,
    /// Digests whose on-disk size differs from a descriptor.
    pub size_mismatch: Vec<Digest>,
}

impl FsckReport {
    /// Whether no problem was found.
    pub fn is_ok(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty() && self.size_mismatch.is_empty()
    }
}

/// An OCI layout used as a content store.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    tmp_dir: PathBuf,
    blobs: BlobStore,
    uploads: Uploads,
    index: RwLock<Index>,
}

impl Store {
    /// Open (or initialize) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_with_tmp(&config.root, config.tmp_dir()).await
    }

    /// Open the store at `root` with the default temporary directory.
    pub async fn open_path(root: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig::new(root.as_ref())).await
    }

    async fn open_with_tmp(root: &Path, tmp_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .storage_context(|| format!("creating {}", root.display()))?;
        let layout = root.join(LAYOUT_FILE);
        match tokio::fs::read(&layout).await {
            Ok(data) => {
                let marker: serde_json::Value = serde_json::from_slice(&data).map_err(|e| {
                    Error::InvalidManifest(format!("{} is corrupt: {e}", layout.display()))
                })?;
                if marker.get("imageLayoutVersion").is_none() {
                    return Err(Error::InvalidManifest(format!(
                        "{} has no imageLayoutVersion",
                        layout.display()
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("initializing layout at {}", root.display());
                tokio::fs::write(&layout, LAYOUT_MARKER)
                    .await
                    .storage_context(|| format!("writing {}", layout.display()))?;
            }
            Err(e) => return Err(Error::storage(format!("reading {}", layout.display()), e)),
        }
        let index = Index::load(root).await?;
        debug!("opened store at {} ({} entries)", root.display(), index.len());
        Ok(Store {
            root: root.to_path_buf(),
            tmp_dir,
            blobs: BlobStore::new(root),
            uploads: Uploads::new(root),
            index: RwLock::new(index),
        })
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory staging layouts and downloads are created in.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The blob CAS. Writes through it bypass the store guard.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Upload sessions of this layout.
    pub fn uploads(&self) -> &Uploads {
        &self.uploads
    }

    /// Ingest `artifact` under `reference`.
    pub async fn add(&self, artifact: &Artifact, reference: &Reference) -> Result<Descriptor> {
        self.add_with_cancel(artifact, reference, &CancellationToken::new())
            .await
    }

    /// Ingest `artifact` under `reference`, stopping early when `cancel` fires.
    ///
    /// Layers are streamed into a staging layout, then the config and the
    /// manifest. Nothing in the store changes until the commit, which
    /// promotes the staged blobs and upserts the descriptor under the
    /// exclusive guard.
    pub async fn add_with_cancel(
        &self,
        artifact: &Artifact,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let kind = artifact.kind();
        let digest = artifact.digest();
        let staging = StagingLayout::create(&self.tmp_dir).await?;

        let mut seen = HashSet::new();
        let mut present = Vec::new();
        let mut pending: Vec<&Layer> = Vec::new();
        for layer in &artifact.layers {
            let layer_digest = &layer.descriptor.digest;
            if !seen.insert(layer_digest.clone()) {
                continue;
            }
            if self.blobs.exists(layer_digest).await {
                present.push(layer_digest.clone());
            } else {
                pending.push(layer);
            }
        }

        let mut staged: Vec<Digest> = stream::iter(pending)
            .map(|layer| staging.write_layer(layer, cancel))
            .buffer_unordered(LAYER_CONCURRENCY)
            .try_collect()
            .await?;

        if let Some(config) = &artifact.config {
            let config_digest = &config.descriptor.digest;
            if seen.insert(config_digest.clone()) {
                if self.blobs.exists(config_digest).await {
                    present.push(config_digest.clone());
                } else {
                    staged.push(staging.write_layer(config, cancel).await?);
                }
            }
        }

        staging.write_bytes(&digest, &artifact.manifest).await?;
        staged.push(digest.clone());

        let mut descriptor = Descriptor::new(
            artifact.media_type.clone(),
            digest.clone(),
            artifact.manifest.len() as u64,
        );
        descriptor.annotations = artifact.annotations.clone();
        let descriptor = descriptor
            .with_annotation(ANNOTATION_REF_NAME, reference.to_string())
            .with_annotation(ANNOTATION_KIND, kind.as_str());
        staging.write_index(&descriptor).await?;

        if cancel.is_cancelled() {
            debug!("add of {reference} cancelled before commit");
            return Err(Error::Cancelled);
        }

        let mut index = self.index.write().await;
        for blob in &present {
            if !self.blobs.exists(blob).await {
                return Err(Error::BlobNotFound(blob.clone()));
            }
        }
        let promoted = staging.promote_into(&self.blobs, &staged).await?;
        index.put(descriptor.clone()).await?;
        drop(index);
        debug!(
            "committed {} from {} ({promoted} new blobs)",
            reference,
            staging.path().display()
        );
        drop(staging);

        info!(
            "added '{}' to store at {}, with digest {}",
            kind.short_name(),
            reference,
            digest
        );
        Ok(descriptor)
    }

    /// Visit every index entry in sorted order.
    pub async fn walk<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&str, &Descriptor) -> Result<()>,
    {
        self.index.read().await.walk(f)
    }

    /// Every index descriptor in sorted order.
    pub async fn list(&self) -> Vec<Descriptor> {
        self.index.read().await.iter().cloned().collect()
    }

    /// The newest descriptor indexed under `reference`.
    pub async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.index.read().await.resolve(reference).cloned()
    }

    /// Read a whole blob.
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let _guard = self.index.read().await;
        self.blobs.read(digest).await
    }

    /// Open a blob for streaming, with its size.
    pub async fn open_blob(&self, digest: &Digest) -> Result<(File, u64)> {
        let _guard = self.index.read().await;
        let size = self.blobs.size(digest).await?;
        Ok((self.blobs.open(digest).await?, size))
    }

    /// Resolve a registry-style `(name, reference)` pair.
    ///
    /// `reference` is a tag or a digest. A digest that is not indexed still
    /// resolves when the CAS holds a manifest with that digest, which is how
    /// the children of an image index are served.
    pub async fn resolve_manifest(&self, name: &str, reference: &str) -> Result<Descriptor> {
        let index = self.index.read().await;
        let not_found = || Error::ReferenceNotFound(format!("{name}:{reference}"));

        if let Ok(digest) = reference.parse::<Digest>() {
            let indexed = index
                .find_latest(|d| d.digest == digest && names_repository(d, name))
                .or_else(|| index.find_latest(|d| d.digest == digest));
            if let Some(descriptor) = indexed {
                return Ok(descriptor.clone());
            }
            let data = match self.blobs.read(&digest).await {
                Ok(data) => data,
                Err(Error::BlobNotFound(_)) => return Err(not_found()),
                Err(e) => return Err(e),
            };
            let document = ManifestDocument::parse(&data, None).map_err(|_| not_found())?;
            let media_type = document.media_type(MEDIA_TYPE_OCI_MANIFEST).to_string();
            return Ok(Descriptor::new(media_type, digest, data.len() as u64));
        }

        index
            .find_latest(|d| {
                parse_ref_name(d)
                    .is_some_and(|r| repository_matches(&r, name) && r.tag() == Some(reference))
            })
            .cloned()
            .ok_or_else(not_found)
    }

    /// Tags indexed under repository `name`, sorted.
    pub async fn tags(&self, name: &str) -> Result<Vec<String>> {
        let index = self.index.read().await;
        let mut tags: Vec<String> = index
            .iter()
            .filter_map(parse_ref_name)
            .filter(|r| repository_matches(r, name))
            .filter_map(|r| r.tag().map(str::to_string))
            .collect();
        tags.sort();
        tags.dedup();
        if tags.is_empty() {
            return Err(Error::ReferenceNotFound(name.to_string()));
        }
        Ok(tags)
    }

    /// Store a manifest pushed through the registry API.
    ///
    /// Every blob or child manifest the document references must already be
    /// in the CAS. A `reference` that is a digest must match the body.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<Descriptor> {
        let content_type = content_type.filter(|ct| {
            is_manifest_media_type(ct) || is_index_media_type(ct)
        });
        let document = ManifestDocument::parse(data, content_type)?;
        let media_type = document
            .media_type(content_type.unwrap_or(MEDIA_TYPE_OCI_MANIFEST))
            .to_string();

        let pinned = reference.parse::<Digest>().ok();
        let digest = match &pinned {
            Some(expected) => {
                let actual = Digest::compute(expected.algorithm(), data);
                if actual != *expected {
                    return Err(Error::DigestMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
                actual
            }
            None => Digest::sha256(data),
        };
        let ref_name = match &pinned {
            Some(d) => format!("{name}@{d}"),
            None => format!("{name}:{reference}"),
        };
        let parsed: Reference = ref_name.parse()?;

        let kind = match &document {
            ManifestDocument::Index(_) => Kind::ImageIndex,
            ManifestDocument::Manifest(m) => {
                let layer_types: Vec<&str> = m.layers.iter().map(|l| l.media_type.as_str()).collect();
                let cosign = parsed.tag().and_then(parse_cosign_tag).map(|(_, k)| k);
                cosign.unwrap_or_else(|| {
                    Kind::from_media_types(&media_type, Some(&m.config.media_type), &layer_types)
                })
            }
        };
        let subject = match &document {
            ManifestDocument::Manifest(m) => m.subject.as_ref().map(|s| s.digest.clone()),
            ManifestDocument::Index(_) => None,
        }
        .or_else(|| parsed.tag().and_then(parse_cosign_tag).map(|(d, _)| d));

        let mut index = self.index.write().await;
        for child in document.children() {
            if !self.blobs.exists(&child.digest).await {
                return Err(Error::InvalidManifest(format!(
                    "{MANIFEST_BLOB_UNKNOWN}: {}",
                    child.digest
                )));
            }
        }
        self.blobs.write(&digest, data, None).await?;
        let mut descriptor = Descriptor::new(media_type, digest.clone(), data.len() as u64)
            .with_annotation(ANNOTATION_REF_NAME, ref_name.clone())
            .with_annotation(ANNOTATION_KIND, kind.as_str());
        if let Some(subject) = subject {
            descriptor = descriptor.with_annotation(ANNOTATION_SUBJECT, subject.to_string());
        }
        index.put(descriptor.clone()).await?;
        info!(
            "added '{}' to store at {}, with digest {}",
            kind.short_name(),
            ref_name,
            digest
        );
        Ok(descriptor)
    }

    /// Verify an upload session and move it into the CAS.
    pub async fn finalize_upload(&self, session: UploadSession, digest: &Digest) -> Result<u64> {
        let _guard = self.index.read().await;
        session.finalize(&self.blobs, digest).await
    }

    /// Upload a whole blob in one request.
    pub async fn upload_blob<R>(&self, digest: &Digest, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.index.read().await;
        upload_monolithic(&self.uploads, &self.blobs, digest, reader).await
    }

    /// Drop every entry whose `ref.name` contains `matcher`.
    ///
    /// Signature-family entries pointing at a removed digest go with it.
    /// Blobs are left for [`Store::gc`].
    pub async fn remove(&self, matcher: &str, force: bool) -> Result<RemoveOutcome> {
        let mut index = self.index.write().await;
        let matches = index.matching(matcher);
        if matches.is_empty() {
            return Err(Error::ReferenceNotFound(matcher.to_string()));
        }
        if matches.len() > 1 && !force {
            return Ok(RemoveOutcome::NeedsConfirmation(matches));
        }
        let subjects: HashSet<String> = matches.iter().map(|d| d.digest.to_string()).collect();
        let peers: Vec<Descriptor> = index
            .iter()
            .filter(|d| !matches.contains(d))
            .filter(|d| {
                d.kind_annotation()
                    .and_then(|k| k.parse::<Kind>().ok())
                    .is_some_and(|k| k.is_signature_family())
            })
            .filter(|d| {
                d.annotation(ANNOTATION_SUBJECT)
                    .is_some_and(|s| subjects.contains(s))
            })
            .cloned()
            .collect();
        let removed: Vec<Descriptor> = matches.into_iter().chain(peers).collect();
        index.delete_all(&removed).await?;
        for descriptor in &removed {
            info!(
                "removed '{}' from store",
                descriptor.ref_name().unwrap_or_default()
            );
        }
        Ok(RemoveOutcome::Removed(removed))
    }

    /// Every descriptor reachable from `roots`, keyed by digest.
    ///
    /// Manifests and indexes are read from the CAS and followed; a missing
    /// manifest ends that branch.
    async fn closure(
        &self,
        roots: impl IntoIterator<Item = Descriptor>,
    ) -> Result<BTreeMap<Digest, Descriptor>> {
        let mut reachable = BTreeMap::new();
        let mut stack: Vec<Descriptor> = roots.into_iter().collect();
        while let Some(descriptor) = stack.pop() {
            if reachable.contains_key(&descriptor.digest) {
                continue;
            }
            reachable.insert(descriptor.digest.clone(), descriptor.clone());
            let media_type = descriptor.media_type.as_str();
            if !is_manifest_media_type(media_type) && !is_index_media_type(media_type) {
                continue;
            }
            let data = match self.blobs.read(&descriptor.digest).await {
                Ok(data) => data,
                Err(Error::BlobNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match ManifestDocument::parse(&data, Some(media_type)) {
                Ok(document) => stack.extend(document.children().into_iter().cloned()),
                Err(e) => warn!("cannot follow {}: {e}", descriptor.digest),
            }
        }
        Ok(reachable)
    }

    /// Delete every blob no index entry reaches.
    pub async fn gc(&self) -> Result<GcResult> {
        let index = self.index.write().await;
        let reachable = self.closure(index.iter().cloned()).await?;
        let mut result = GcResult::default();
        for (digest, size) in self.blobs.list().await? {
            if reachable.contains_key(&digest) {
                continue;
            }
            match self.blobs.delete(&digest).await {
                Ok(()) | Err(Error::BlobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            debug!("gc: removed {digest} ({size} bytes)");
            result.blobs_removed += 1;
            result.bytes_removed += size;
        }
        drop(index);
        info!(
            "garbage collection removed {} blobs ({} bytes)",
            result.blobs_removed, result.bytes_removed
        );
        Ok(result)
    }

    /// Send every index entry to `target`.
    pub async fn copy(&self, target: &dyn Target) -> Result<CopyReport> {
        self.copy_with_cancel(target, &CancellationToken::new())
            .await
    }

    /// Send every index entry to `target`, stopping when `cancel` fires.
    ///
    /// Blobs are sent once per destination repository and run. Entries are
    /// visited in index order, so a target sees artifacts before their
    /// signatures.
    pub async fn copy_with_cancel(
        &self,
        target: &dyn Target,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let index = self.index.read().await;
        let mut report = CopyReport::default();
        let mut sent = HashSet::new();
        for descriptor in index.iter() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(source) = parse_ref_name(descriptor) else {
                warn!("skipping {} without a usable reference", descriptor.digest);
                continue;
            };
            let dest = target.rewrite(&source)?;
            self.copy_manifest(target, &dest, descriptor, &mut sent, &mut report, cancel)
                .await?;
            info!("copied {source} to {dest}");
        }
        Ok(report)
    }

    fn copy_manifest<'a>(
        &'a self,
        target: &'a dyn Target,
        dest: &'a Reference,
        descriptor: &'a Descriptor,
        sent: &'a mut HashSet<(String, Digest)>,
        report: &'a mut CopyReport,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let data = self.blobs.read(&descriptor.digest).await?;
            match ManifestDocument::parse(&data, Some(&descriptor.media_type))? {
                ManifestDocument::Index(document) => {
                    for child in &document.manifests {
                        if !self.blobs.exists(&child.digest).await {
                            warn!("{dest}: child {} not in store, skipping", child.digest);
                            continue;
                        }
                        let child_ref = dest.with_digest(child.digest.clone());
                        self.copy_manifest(target, &child_ref, child, sent, report, cancel)
                            .await?;
                    }
                }
                ManifestDocument::Manifest(manifest) => {
                    for blob in std::iter::once(&manifest.config).chain(&manifest.layers) {
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        if !sent.insert((dest.name(), blob.digest.clone())) {
                            continue;
                        }
                        if target.blob_exists(dest, blob).await? {
                            report.blobs_skipped += 1;
                            continue;
                        }
                        let file = self.blobs.open(&blob.digest).await?;
                        target.put_blob(dest, blob, Box::pin(file)).await?;
                        report.blobs_copied += 1;
                    }
                }
            }
            target
                .put_manifest(dest, &data, &descriptor.media_type)
                .await?;
            report.manifests += 1;
            Ok(())
        }
        .boxed()
    }

    /// Write the titled layers of the artifact at `reference` into `dir`.
    pub async fn extract(&self, reference: &str, dir: &Path) -> Result<Vec<PathBuf>> {
        let index = self.index.read().await;
        let descriptor = index.resolve(reference)?.clone();
        let data = self.blobs.read(&descriptor.digest).await?;
        let ManifestDocument::Manifest(manifest) =
            ManifestDocument::parse(&data, Some(&descriptor.media_type))?
        else {
            return Err(Error::InvalidManifest(format!(
                "{reference} is an image index and has no files to extract"
            )));
        };
        let source = parse_ref_name(&descriptor)
            .ok_or_else(|| Error::InvalidReference(reference.to_string()))?;
        let target = DirectoryTarget::new(dir);
        let mut written = Vec::new();
        for layer in &manifest.layers {
            let Some(title) = layer.title() else {
                continue;
            };
            let path = target.destination(title)?;
            let file = self.blobs.open(&layer.digest).await?;
            target.put_blob(&source, layer, Box::pin(file)).await?;
            written.push(path);
        }
        if written.is_empty() {
            warn!("{reference} has no titled layers");
        }
        Ok(written)
    }

    /// Check that every blob verifies and every reachable descriptor matches its blob.
    pub async fn fsck(&self) -> Result<FsckReport> {
        let index = self.index.read().await;
        let mut report = FsckReport::default();
        for (digest, _) in self.blobs.list().await? {
            report.checked += 1;
            match self.blobs.verify(&digest).await {
                Ok(_) => {}
                Err(Error::DigestMismatch { .. }) => report.corrupt.push(digest),
                Err(e) => return Err(e),
            }
        }
        for (digest, descriptor) in self.closure(index.iter().cloned()).await? {
            match self.blobs.size(&digest).await {
                Ok(size) if size != descriptor.size => report.size_mismatch.push(digest),
                Ok(_) => {}
                Err(Error::BlobNotFound(_)) => report.missing.push(digest),
                Err(e) => return Err(e),
            }
        }
        drop(index);
        if report.is_ok() {
            info!("fsck: {} blobs verified", report.checked);
        } else {
            warn!(
                "fsck: {} corrupt, {} missing, {} size mismatches",
                report.corrupt.len(),
                report.missing.len(),
                report.size_mismatch.len()
            );
        }
        Ok(report)
    }

    /// Pack the whole layout into a `.tar.zst` archive at `out`.
    pub async fn save(&self, out: &Path) -> Result<()> {
        let _guard = self.index.read().await;
        archive::pack(&self.root, out).await?;
        info!("saved store {} to {}", self.root.display(), out.display());
        Ok(())
    }

    /// Merge the layout packed in `archive` into this store.
    ///
    /// Returns the number of index entries merged.
    pub async fn load(&self, archive_path: &Path, cancel: &CancellationToken) -> Result<usize> {
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .storage_context(|| format!("creating {}", self.tmp_dir.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("hauler-load-")
            .tempdir_in(&self.tmp_dir)
            .storage_context(|| format!("creating load directory in {}", self.tmp_dir.display()))?;
        archive::unpack(archive_path, dir.path(), UnpackOptions::default()).await?;
        let other = Store::open_with_tmp(dir.path(), self.tmp_dir.clone()).await?;

        let descriptors = other.index.read().await.by_age();
        let reachable = other.closure(descriptors.iter().cloned()).await?;

        let mut index = self.index.write().await;
        for digest in reachable.keys() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !other.blobs.exists(digest).await {
                warn!("archive lacks blob {digest}");
                continue;
            }
            other.blobs.verify(digest).await?;
            match self.blobs.promote(&other.blobs.path(digest), digest).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        let count = descriptors.len();
        index.put_all(descriptors).await?;
        drop(index);
        info!(
            "loaded {count} entries from {} into {}",
            archive_path.display(),
            self.root.display()
        );
        Ok(count)
    }
}

fn parse_ref_name(descriptor: &Descriptor) -> Option<Reference> {
    descriptor.ref_name()?.parse().ok()
}

fn repository_matches(reference: &Reference, name: &str) -> bool {
    reference.repository() == name || reference.name() == name
}

fn names_repository(descriptor: &Descriptor, name: &str) -> bool {
    parse_ref_name(descriptor).is_some_and(|r| repository_matches(&r, name))
}
