//! Resumable blob uploads under `uploads/<uuid>`.
//!
//! A session is a plain file named by a fresh UUID. Its length is the
//! upload offset, so no other state is kept: a session is opened, appended
//! to any number of times, and finally either finalized into the CAS or
//! discarded. Both end states consume the [`UploadSession`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::blob::{copy_hashing, hash_reader, BlobStore};
use crate::digest::Digest;
use crate::error::{Error, IoContext, Result};

/// Directory name of upload sessions inside a layout.
pub const UPLOADS_DIR: &str = "uploads";

/// The `uploads/` directory of one layout.
#[derive(Debug, Clone)]
pub struct Uploads {
    dir: PathBuf,
}

impl Uploads {
    /// Sessions of the layout rooted at `layout_root`.
    pub fn new(layout_root: impl AsRef<Path>) -> Self {
        Uploads {
            dir: layout_root.as_ref().join(UPLOADS_DIR),
        }
    }

    /// Open a new, empty session.
    pub async fn start(&self) -> Result<UploadSession> {
        fs::create_dir_all(&self.dir)
            .await
            .storage_context(|| format!("creating {}", self.dir.display()))?;
        let id = Uuid::new_v4();
        let path = self.dir.join(id.to_string());
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .storage_context(|| format!("creating upload session {id}"))?;
        debug!("opened upload session {id}");
        Ok(UploadSession { id, path })
    }

    /// Look up an existing session.
    pub async fn get(&self, id: &str) -> Result<UploadSession> {
        let id = Uuid::parse_str(id).map_err(|_| Error::UploadUnknown(id.to_string()))?;
        let path = self.dir.join(id.to_string());
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(UploadSession { id, path }),
            Ok(_) => Err(Error::UploadUnknown(id.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::UploadUnknown(id.to_string())),
            Err(e) => Err(Error::storage(format!("stat of upload session {id}"), e)),
        }
    }

    /// Delete sessions last modified more than `ttl` ago. Returns how many.
    pub async fn reap(&self, ttl: Duration) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::storage(format!("listing {}", self.dir.display()), e)),
        };
        let now = SystemTime::now();
        let mut reaped = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .storage_context(|| format!("listing {}", self.dir.display()))?
        {
            let meta = entry
                .metadata()
                .await
                .storage_context(|| format!("stat of {}", entry.path().display()))?;
            let modified = meta.modified().unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or_default();
            if meta.is_file() && age >= ttl {
                warn!(
                    "reaping abandoned upload session {}",
                    entry.file_name().to_string_lossy()
                );
                fs::remove_file(entry.path())
                    .await
                    .storage_context(|| format!("removing {}", entry.path().display()))?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

/// One upload in progress.
#[derive(Debug)]
pub struct UploadSession {
    id: Uuid,
    path: PathBuf,
}

impl UploadSession {
    /// Session identifier.
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Bytes received so far.
    pub async fn len(&self) -> Result<u64> {
        fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .storage_context(|| format!("stat of upload session {}", self.id))
    }

    /// Append `reader` to the session.
    ///
    /// When `start` is given it must equal the current length, as required
    /// for chunks carrying `Content-Range`. Returns the new length.
    pub async fn append<R>(&self, start: Option<u64>, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let current = self.len().await?;
        if let Some(start) = start {
            if start != current {
                return Err(Error::InvalidRange {
                    expected: current,
                    found: start,
                });
            }
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .storage_context(|| format!("opening upload session {}", self.id))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .storage_context(|| format!("appending to upload session {}", self.id))?;
        file.flush()
            .await
            .storage_context(|| format!("flushing upload session {}", self.id))?;
        Ok(current + written)
    }

    /// Verify the session against `expected` and move it into `blobs`.
    ///
    /// On mismatch the session is deleted and the CAS is left untouched.
    pub async fn finalize(self, blobs: &BlobStore, expected: &Digest) -> Result<u64> {
        let file = fs::File::open(&self.path)
            .await
            .storage_context(|| format!("opening upload session {}", self.id))?;
        let (actual, size) = hash_reader(expected.algorithm(), file, None).await?;
        if actual != *expected {
            self.discard().await?;
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        match blobs.promote(&self.path, expected).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!("upload {} duplicates existing blob {expected}", self.id);
                self.discard().await?;
            }
            Err(e) => return Err(e),
        }
        debug!("finalized upload into {expected} ({size} bytes)");
        Ok(size)
    }

    /// Drop the session and its bytes.
    pub async fn discard(self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("discarding upload session {}", self.id), e)),
        }
    }
}

/// Stream `reader` into a fresh session and finalize it in one step.
pub async fn upload_monolithic<R>(
    uploads: &Uploads,
    blobs: &BlobStore,
    expected: &Digest,
    reader: R,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let session = uploads.start().await?;
    let mut file = OpenOptions::new()
        .append(true)
        .open(&session.path)
        .await
        .storage_context(|| format!("opening upload session {}", session.id))?;
    let copied = copy_hashing(expected.algorithm(), reader, &mut file, None).await;
    drop(file);
    match copied {
        Ok((actual, _)) if actual != *expected => {
            session.discard().await?;
            Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual,
            })
        }
        Ok(_) => session.finalize(blobs, expected).await,
        Err(e) => {
            session.discard().await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::tempdir;

    #[tokio::test]
    async fn test_chunked_upload() -> anyhow::Result<()> {
        let dir = tempdir();
        let uploads = Uploads::new(dir.path());
        let blobs = BlobStore::new(dir.path());
        let data = b"0123456789abcdefghijABCDEFGHIJ";
        let digest = Digest::sha256(data);

        let session = uploads.start().await?;
        assert_eq!(session.append(Some(0), &data[0..10]).await?, 10);
        let session = uploads.get(&session.id().to_string()).await?;
        assert_eq!(session.append(Some(10), &data[10..20]).await?, 20);
        assert_eq!(session.append(None, &data[20..30]).await?, 30);

        assert_eq!(session.finalize(&blobs, &digest).await?, 30);
        assert_eq!(blobs.read(&digest).await?, data);
        assert_eq!(std::fs::read_dir(dir.path().join(UPLOADS_DIR))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_order_chunk() -> anyhow::Result<()> {
        let dir = tempdir();
        let uploads = Uploads::new(dir.path());
        let session = uploads.start().await?;
        session.append(Some(0), &b"12345"[..]).await?;
        let err = session.append(Some(3), &b"xx"[..]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRange { expected: 5, found: 3 }));
        assert_eq!(session.len().await?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_mismatch_discards() -> anyhow::Result<()> {
        let dir = tempdir();
        let uploads = Uploads::new(dir.path());
        let blobs = BlobStore::new(dir.path());
        let session = uploads.start().await?;
        let id = session.id().to_string();
        session.append(None, &b"actual bytes"[..]).await?;

        let wrong = Digest::sha256(b"other bytes");
        let err = session.finalize(&blobs, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(blobs.list().await?.is_empty());
        assert!(matches!(uploads.get(&id).await, Err(Error::UploadUnknown(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempdir();
        let uploads = Uploads::new(dir.path());
        assert!(matches!(uploads.get("not-a-uuid").await, Err(Error::UploadUnknown(_))));
        assert!(matches!(
            uploads.get(&Uuid::new_v4().to_string()).await,
            Err(Error::UploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_monolithic_and_reap() -> anyhow::Result<()> {
        let dir = tempdir();
        let uploads = Uploads::new(dir.path());
        let blobs = BlobStore::new(dir.path());
        let digest = Digest::sha256(b"whole");
        upload_monolithic(&uploads, &blobs, &digest, &b"whole"[..]).await?;
        assert!(blobs.exists(&digest).await);

        let bad = upload_monolithic(&uploads, &blobs, &Digest::sha256(b"x"), &b"y"[..]).await;
        assert!(matches!(bad, Err(Error::DigestMismatch { .. })));

        uploads.start().await?;
        assert_eq!(uploads.reap(Duration::from_secs(3600)).await?, 0);
        assert_eq!(uploads.reap(Duration::ZERO).await?, 1);
        Ok(())
    }
}
