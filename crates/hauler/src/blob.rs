//! Content-addressed blob storage under `blobs/<algorithm>/<hex>`.
//!
//! Writes go to a `.tmp-<uuid>` file in the algorithm directory while the
//! running hash is computed, and are renamed into place only once the
//! digest verifies. A failed or cancelled write therefore never leaves a
//! partial entry behind: the temporary file is deleted when it is dropped.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use rustix::io::Errno;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::digest::{Algorithm, Digest};
use crate::error::{Error, IoContext, Result};

/// Prefix of in-flight temporary files inside an algorithm directory.
pub const TMP_PREFIX: &str = ".tmp-";

const COPY_BUFFER: usize = 64 * 1024;

/// The `blobs/` tree of one layout.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

fn is_cross_device(err: &io::Error) -> bool {
    Errno::from_io_error(err) == Some(Errno::XDEV)
}

impl BlobStore {
    /// Blob storage for the layout rooted at `layout_root`.
    pub fn new(layout_root: impl AsRef<Path>) -> Self {
        BlobStore {
            dir: layout_root.as_ref().join("blobs"),
        }
    }

    /// The `blobs/` directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk path of `digest`.
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.dir
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Create the algorithm directory if needed; losing a creation race is fine.
    async fn ensure_dir(&self, algorithm: Algorithm) -> Result<PathBuf> {
        let dir = self.dir.join(algorithm.as_str());
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir)
                    .await
                    .storage_context(|| format!("creating {}", dir.display()))?;
                Ok(dir)
            }
            Err(e) => Err(Error::storage(format!("creating {}", dir.display()), e)),
        }
    }

    fn tempfile_in(dir: &Path) -> Result<(File, tempfile::TempPath)> {
        let prefix = format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4());
        let tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(0)
            .tempfile_in(dir)
            .storage_context(|| format!("creating temporary file in {}", dir.display()))?;
        let (file, path) = tmp.into_parts();
        Ok((File::from_std(file), path))
    }

    /// Whether `digest` is present. Only stats the file.
    pub async fn exists(&self, digest: &Digest) -> bool {
        fs::metadata(self.path(digest))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Size of the stored blob.
    pub async fn size(&self, digest: &Digest) -> Result<u64> {
        match fs::metadata(self.path(digest)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound(digest.clone())),
            Err(e) => Err(Error::storage(format!("stat of {digest}"), e)),
        }
    }

    /// Open a blob for streaming.
    pub async fn open(&self, digest: &Digest) -> Result<File> {
        match File::open(self.path(digest)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound(digest.clone())),
            Err(e) => Err(Error::storage(format!("opening blob {digest}"), e)),
        }
    }

    /// Read a whole blob into memory.
    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut file = self.open(digest).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .storage_context(|| format!("reading blob {digest}"))?;
        Ok(data)
    }

    /// Remove a blob.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BlobNotFound(digest.clone())),
            Err(e) => Err(Error::storage(format!("deleting blob {digest}"), e)),
        }
    }

    /// Re-hash a stored blob, returning its size when it verifies.
    pub async fn verify(&self, digest: &Digest) -> Result<u64> {
        let file = self.open(digest).await?;
        let (actual, size) = hash_reader(digest.algorithm(), file, None).await?;
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(size)
    }

    /// Stream `reader` into the CAS under `expected`.
    ///
    /// If a verified copy is already present the reader is not consumed.
    /// Returns the blob size.
    pub async fn write<R>(
        &self,
        expected: &Digest,
        reader: R,
        cancel: Option<&CancellationToken>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if self.exists(expected).await {
            match self.verify(expected).await {
                Ok(size) => {
                    trace!("blob {expected} already present");
                    return Ok(size);
                }
                Err(Error::DigestMismatch { .. }) => {
                    debug!("replacing corrupt blob {expected}");
                }
                Err(e) => return Err(e),
            }
        }

        let dir = self.ensure_dir(expected.algorithm()).await?;
        let (mut file, tmp_path) = Self::tempfile_in(&dir)?;
        let (actual, size) = copy_hashing(expected.algorithm(), reader, &mut file, cancel).await?;
        if actual != *expected {
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        file.sync_all()
            .await
            .storage_context(|| format!("syncing blob {expected}"))?;
        drop(file);

        tmp_path
            .persist(self.path(expected))
            .map_err(|e| Error::storage(format!("renaming blob {expected} into place"), e.error))?;
        debug!("stored blob {expected} ({size} bytes)");
        Ok(size)
    }

    /// Hash `data` with sha256 and store it.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256(data);
        self.write(&digest, data, None).await?;
        Ok(digest)
    }

    /// Move an already verified file into the CAS.
    ///
    /// Attempts a rename and falls back to a verified copy when `src` lives on
    /// another filesystem. Fails with [`Error::AlreadyExists`] if the digest
    /// is present; `src` is left in place in that case.
    pub async fn promote(&self, src: &Path, digest: &Digest) -> Result<()> {
        if self.exists(digest).await {
            return Err(Error::AlreadyExists(digest.clone()));
        }
        self.ensure_dir(digest.algorithm()).await?;
        let dst = self.path(digest);
        match fs::rename(src, &dst).await {
            Ok(()) => {
                trace!("promoted {} to {digest}", src.display());
                Ok(())
            }
            Err(e) if is_cross_device(&e) => {
                debug!("{} is on another filesystem, copying {digest}", src.display());
                let file = File::open(src)
                    .await
                    .storage_context(|| format!("opening {}", src.display()))?;
                self.write(digest, file, None).await?;
                fs::remove_file(src)
                    .await
                    .storage_context(|| format!("removing {}", src.display()))?;
                Ok(())
            }
            Err(e) => Err(Error::storage(format!("promoting {digest}"), e)),
        }
    }

    /// Every stored blob with its size, skipping in-flight temporary files.
    pub async fn list(&self) -> Result<Vec<(Digest, u64)>> {
        let mut blobs = Vec::new();
        for algorithm in Algorithm::all() {
            let dir = self.dir.join(algorithm.as_str());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage(format!("listing {}", dir.display()), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .storage_context(|| format!("listing {}", dir.display()))?
            {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let Ok(digest) = Digest::new(algorithm, name) else {
                    trace!("ignoring stray file {name} in {}", dir.display());
                    continue;
                };
                let meta = entry
                    .metadata()
                    .await
                    .storage_context(|| format!("stat of {digest}"))?;
                if meta.is_file() {
                    blobs.push((digest, meta.len()));
                }
            }
        }
        blobs.sort();
        Ok(blobs)
    }
}

async fn next_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: Option<&CancellationToken>,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let read = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            n = reader.read(buf) => n,
        },
        None => reader.read(buf).await,
    };
    read.storage_context(|| "reading blob content")
}

/// Hash everything `reader` yields.
pub(crate) async fn hash_reader<R>(
    algorithm: Algorithm,
    mut reader: R,
    cancel: Option<&CancellationToken>,
) -> Result<(Digest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;
    loop {
        let n = next_chunk(&mut reader, &mut buf, cancel).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

/// Copy `reader` into `file` while hashing.
pub(crate) async fn copy_hashing<R>(
    algorithm: Algorithm,
    mut reader: R,
    file: &mut File,
    cancel: Option<&CancellationToken>,
) -> Result<(Digest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;
    loop {
        let n = next_chunk(&mut reader, &mut buf, cancel).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .storage_context(|| "writing blob content")?;
        size += n as u64;
    }
    file.flush().await.storage_context(|| "flushing blob content")?;
    Ok((hasher.finalize(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::tempdir;

    #[tokio::test]
    async fn test_write_read_roundtrip() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let digest = Digest::sha256(b"hello world");

        assert!(!blobs.exists(&digest).await);
        assert_eq!(blobs.write(&digest, &b"hello world"[..], None).await?, 11);
        assert!(blobs.exists(&digest).await);
        assert_eq!(blobs.size(&digest).await?, 11);
        assert_eq!(blobs.read(&digest).await?, b"hello world");
        assert_eq!(
            blobs.path(&digest),
            dir.path().join("blobs/sha256").join(digest.hex())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_write_mismatch_leaves_nothing() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let digest = Digest::sha256(b"expected");

        let err = blobs.write(&digest, &b"something else"[..], None).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!blobs.exists(&digest).await);
        assert!(blobs.list().await?.is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("blobs/sha256"))?.collect();
        assert!(leftovers.is_empty(), "temporary file left behind");
        Ok(())
    }

    #[tokio::test]
    async fn test_write_is_idempotent() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let digest = blobs.write_bytes(b"same").await?;
        // a second write with a broken reader never touches the reader
        let size = blobs.write(&digest, &b""[..], None).await?;
        assert_eq!(size, 4);
        assert_eq!(blobs.list().await?, vec![(digest, 4)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_repairs_corrupt_blob() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let digest = blobs.write_bytes(b"original").await?;
        std::fs::write(blobs.path(&digest), b"tampered")?;
        assert!(blobs.verify(&digest).await.is_err());

        blobs.write(&digest, &b"original"[..], None).await?;
        assert_eq!(blobs.verify(&digest).await?, 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_write() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let digest = Digest::sha256(b"data");
        let err = blobs.write(&digest, &b"data"[..], Some(&token)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(blobs.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_sha512_and_missing() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path());
        let digest = Digest::compute(Algorithm::Sha512, b"wide");
        blobs.write(&digest, &b"wide"[..], None).await?;
        assert!(dir.path().join("blobs/sha512").join(digest.hex()).exists());

        let missing = Digest::sha256(b"missing");
        assert!(matches!(blobs.open(&missing).await, Err(Error::BlobNotFound(_))));
        assert!(matches!(blobs.delete(&missing).await, Err(Error::BlobNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_promote() -> anyhow::Result<()> {
        let dir = tempdir();
        let blobs = BlobStore::new(dir.path().join("layout"));
        let src = dir.path().join("incoming");
        std::fs::write(&src, b"promoted")?;
        let digest = Digest::sha256(b"promoted");

        blobs.promote(&src, &digest).await?;
        assert!(!src.exists());
        assert_eq!(blobs.read(&digest).await?, b"promoted");

        std::fs::write(&src, b"promoted")?;
        let err = blobs.promote(&src, &digest).await.unwrap_err();
        assert!(err.is_already_exists());
        Ok(())
    }
}
