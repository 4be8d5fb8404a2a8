//! The layout's `index.json`.
//!
//! Entries are keyed by `(digest, ref.name, kind)`. The map key is built so
//! that its natural ordering is the on-disk order: image-family kinds first,
//! then signature-family kinds, each group by reference and then digest.
//! Every mutation rewrites the whole file through a temporary file and a
//! rename, so the file and the in-memory map agree after each success.
//!
//! Several entries may share a reference; the newest one resolves. Insertion
//! order is kept on disk in the `dev.hauler/index.order` annotation and
//! stripped again on load, so descriptors handed out never carry it.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs;

use crate::descriptor::{Descriptor, ImageIndex, ANNOTATION_REF_NAME};
use crate::digest::Digest;
use crate::error::{Error, IoContext, Result};
use crate::kind::sort_group;
use crate::reference::Reference;

/// File name of the index inside a layout.
pub const INDEX_FILE: &str = "index.json";

const ANNOTATION_ORDER: &str = "dev.hauler/index.order";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    group: u8,
    ref_name: String,
    digest: Digest,
    kind: String,
}

impl IndexKey {
    fn of(desc: &Descriptor) -> Self {
        let kind = desc.kind_annotation().unwrap_or_default().to_string();
        IndexKey {
            group: sort_group(&kind),
            ref_name: desc.ref_name().unwrap_or_default().to_string(),
            digest: desc.digest.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: Descriptor,
    seq: u64,
}

/// In-memory view of `index.json`.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    entries: BTreeMap<IndexKey, Entry>,
    next_seq: u64,
}

impl Index {
    /// Load the index of the layout at `root`, creating an empty one if absent.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(INDEX_FILE);
        let mut index = Index {
            path,
            entries: BTreeMap::new(),
            next_seq: 0,
        };
        let data = match fs::read(&index.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("initializing {}", index.path.display());
                index.save().await?;
                return Ok(index);
            }
            Err(e) => return Err(Error::storage(format!("reading {}", index.path.display()), e)),
        };
        let document: ImageIndex = serde_json::from_slice(&data).map_err(|e| {
            Error::InvalidManifest(format!("{} is corrupt: {e}", index.path.display()))
        })?;
        let mut ordered = Vec::new();
        let mut unordered = Vec::new();
        for mut descriptor in document.manifests {
            if descriptor.ref_name().is_none() {
                warn!(
                    "index entry {} has no {ANNOTATION_REF_NAME} annotation",
                    descriptor.digest
                );
            }
            let order = descriptor.annotations.remove(ANNOTATION_ORDER);
            match order.as_deref().map(str::parse::<u64>) {
                Some(Ok(seq)) => ordered.push((seq, descriptor)),
                Some(Err(_)) => {
                    warn!("index entry {} has a malformed order", descriptor.digest);
                    unordered.push(descriptor);
                }
                None => unordered.push(descriptor),
            }
        }
        // entries written without an order count as older than all others
        let offset = unordered.len() as u64;
        for descriptor in unordered {
            index.insert(descriptor);
        }
        for (seq, descriptor) in ordered {
            index.insert_at(offset + seq, descriptor);
        }
        Ok(index)
    }

    fn insert(&mut self, descriptor: Descriptor) {
        self.insert_at(self.next_seq, descriptor);
    }

    fn insert_at(&mut self, seq: u64, descriptor: Descriptor) {
        self.next_seq = self.next_seq.max(seq + 1);
        self.entries
            .insert(IndexKey::of(&descriptor), Entry { descriptor, seq });
    }

    /// Path of `index.json`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The document as it is written to disk.
    pub fn to_document(&self) -> ImageIndex {
        let mut document = ImageIndex::empty();
        document.manifests = self
            .entries
            .values()
            .map(|entry| {
                entry
                    .descriptor
                    .clone()
                    .with_annotation(ANNOTATION_ORDER, entry.seq.to_string())
            })
            .collect();
        document
    }

    /// Write the sorted index through a temporary file.
    pub async fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.to_document())
            .map_err(|e| Error::storage("serializing index", io::Error::other(e)))?;
        let tmp = self
            .path
            .with_file_name(format!(".{INDEX_FILE}.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, &data)
            .await
            .storage_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::storage(format!("replacing {}", self.path.display()), e));
        }
        Ok(())
    }

    /// Insert or replace `descriptor`, then persist.
    pub async fn put(&mut self, descriptor: Descriptor) -> Result<()> {
        if descriptor.ref_name().is_none() {
            return Err(Error::InvalidReference(format!(
                "descriptor {} has no {ANNOTATION_REF_NAME} annotation",
                descriptor.digest
            )));
        }
        self.insert(descriptor);
        self.save().await
    }

    /// Insert several descriptors with a single save.
    pub async fn put_all(&mut self, descriptors: Vec<Descriptor>) -> Result<()> {
        if let Some(bare) = descriptors.iter().find(|d| d.ref_name().is_none()) {
            return Err(Error::InvalidReference(format!(
                "descriptor {} has no {ANNOTATION_REF_NAME} annotation",
                bare.digest
            )));
        }
        for descriptor in descriptors {
            self.insert(descriptor);
        }
        self.save().await
    }

    /// Remove `descriptor` by key, then persist. Returns whether it was present.
    pub async fn delete(&mut self, descriptor: &Descriptor) -> Result<bool> {
        let removed = self.entries.remove(&IndexKey::of(descriptor)).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Remove several descriptors with a single save. Returns how many were present.
    pub async fn delete_all(&mut self, descriptors: &[Descriptor]) -> Result<usize> {
        let removed = descriptors
            .iter()
            .filter(|d| self.entries.remove(&IndexKey::of(d)).is_some())
            .count();
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Visit every entry in sorted order; an error from `f` stops the walk.
    pub fn walk<F, E>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&str, &Descriptor) -> std::result::Result<(), E>,
    {
        for (key, entry) in &self.entries {
            f(&key.ref_name, &entry.descriptor)?;
        }
        Ok(())
    }

    /// Descriptors in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }

    /// Descriptors oldest first.
    pub fn by_age(&self) -> Vec<Descriptor> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recently inserted descriptor whose `ref.name` is `reference`.
    ///
    /// Falls back to the normalized form (default namespace and `latest`)
    /// when nothing matches literally.
    pub fn resolve(&self, reference: &str) -> Result<&Descriptor> {
        self.latest_where(|name| name == reference)
            .or_else(|| {
                let normalized = Reference::with_default_namespace(reference)
                    .ok()?
                    .or_latest()
                    .to_string();
                self.latest_where(|name| name == normalized)
            })
            .ok_or_else(|| Error::ReferenceNotFound(reference.to_string()))
    }

    fn latest_where(&self, pred: impl Fn(&str) -> bool) -> Option<&Descriptor> {
        self.find_latest(|d| pred(d.ref_name().unwrap_or_default()))
    }

    /// The most recently inserted descriptor accepted by `pred`.
    pub fn find_latest(&self, pred: impl Fn(&Descriptor) -> bool) -> Option<&Descriptor> {
        self.entries
            .values()
            .filter(|entry| pred(&entry.descriptor))
            .max_by_key(|entry| entry.seq)
            .map(|entry| &entry.descriptor)
    }

    /// Every descriptor whose `ref.name` contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<Descriptor> {
        self.entries
            .iter()
            .filter(|(key, _)| key.ref_name.contains(needle))
            .map(|(_, entry)| entry.descriptor.clone())
            .collect()
    }
}
