//! Store archives.
//!
//! [`pack`] writes a layout as a zstd-compressed tarball whose entry names
//! are relative to the layout root and start with `./`, sorted by path.
//! [`unpack`] accepts that format and anything else commonly used to carry
//! a layout around: tar compressed with gzip, bzip2, xz, zstd, lz4 or
//! brotli, plain tar, and zip. The format is recognized from magic bytes.
//!
//! Unpacking validates every entry before writing anything, so an archive
//! with one hostile path leaves the destination untouched.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_compression::tokio::bufread::{
    BrotliDecoder, BzDecoder, GzipDecoder, Lz4Decoder, XzDecoder,
};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use walkdir::WalkDir;

use crate::blob::TMP_PREFIX;
use crate::error::{Error, IoContext, Result};

const ZSTD_LEVEL: i32 = 3;
const MAGIC_LEN: usize = 262;
const TAR_NAME_LEN: usize = 100;
const GNU_LONG_NAME: &[u8] = b"././@LongLink";
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Container and compression of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed tar.
    Tar,
    /// tar + gzip.
    TarGzip,
    /// tar + bzip2.
    TarBzip2,
    /// tar + xz.
    TarXz,
    /// tar + zstd.
    TarZstd,
    /// tar + lz4 frame.
    TarLz4,
    /// tar + brotli, which has no magic number.
    TarBrotli,
    /// zip.
    Zip,
}

/// Identify an archive from its first bytes.
///
/// Brotli streams carry no signature, so anything unrecognized is assumed
/// to be brotli and will fail to decode if it is not.
pub fn detect_format(magic: &[u8]) -> ArchiveFormat {
    if magic.starts_with(&[0x1f, 0x8b]) {
        ArchiveFormat::TarGzip
    } else if magic.starts_with(b"BZh") {
        ArchiveFormat::TarBzip2
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        ArchiveFormat::TarXz
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        ArchiveFormat::TarZstd
    } else if magic.starts_with(&[0x04, 0x22, 0x4d, 0x18]) {
        ArchiveFormat::TarLz4
    } else if magic.starts_with(b"PK\x03\x04") {
        ArchiveFormat::Zip
    } else if magic.len() >= 262 && &magic[257..262] == b"ustar" {
        ArchiveFormat::Tar
    } else {
        ArchiveFormat::TarBrotli
    }
}

/// Knobs for [`unpack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Fail on symlinks and hardlinks instead of skipping them.
    pub reject_links: bool,
}

/// What [`unpack`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Regular files written.
    pub files: usize,
    /// Directories created.
    pub directories: usize,
    /// Links skipped.
    pub skipped_links: usize,
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::storage("archive task failed", io::Error::other(e))
}

/// Pack the layout at `root` into a `.tar.zst` at `out`, replacing it.
pub async fn pack(root: &Path, out: &Path) -> Result<()> {
    let root = root.to_path_buf();
    let out = out.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&root, &out))
        .await
        .map_err(join_error)?
}

fn pack_blocking(root: &Path, out: &Path) -> Result<()> {
    let root = fs::canonicalize(root).storage_context(|| format!("resolving {}", root.display()))?;
    let out_dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let out_dir = fs::canonicalize(&out_dir)
        .storage_context(|| format!("resolving {}", out_dir.display()))?;
    let out_name = out
        .file_name()
        .ok_or_else(|| Error::UnsafePath(out.to_path_buf()))?;
    let out_path = out_dir.join(out_name);

    let tmp = tempfile::Builder::new()
        .prefix(".hauler-save-")
        .tempfile_in(&out_dir)
        .storage_context(|| format!("creating temporary archive in {}", out_dir.display()))?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::storage("walking store", io::Error::other(e)))?;
        let path = entry.path();
        if path == out_path || path == tmp.path() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.contains(TMP_PREFIX) {
            trace!("skipping in-flight {}", path.display());
            continue;
        }
        let Ok(relative) = path.strip_prefix(&root) else {
            continue;
        };
        let relative = relative
            .to_str()
            .ok_or_else(|| Error::UnsafePath(relative.to_path_buf()))?
            .to_string();
        entries.push((relative, entry));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let encoder = zstd::Encoder::new(tmp.as_file(), ZSTD_LEVEL)
        .storage_context(|| "starting zstd encoder")?;
    let mut builder = tar::Builder::new(encoder);
    for (relative, entry) in &entries {
        let file_type = entry.file_type();
        let meta = entry
            .metadata()
            .map_err(|e| Error::storage(format!("stat of {relative}"), io::Error::other(e)))?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
        if file_type.is_dir() {
            header.set_size(0);
            append_raw(&mut builder, &mut header, &format!("./{relative}/"), io::empty())
                .storage_context(|| format!("archiving {relative}"))?;
        } else if file_type.is_file() {
            let file = File::open(entry.path())
                .storage_context(|| format!("opening {relative}"))?;
            append_raw(&mut builder, &mut header, &format!("./{relative}"), file)
                .storage_context(|| format!("archiving {relative}"))?;
        } else {
            warn!("not archiving {relative}: not a regular file or directory");
        }
    }
    let encoder = builder
        .into_inner()
        .storage_context(|| "finishing tar stream")?;
    encoder.finish().storage_context(|| "finishing zstd stream")?;
    tmp.as_file()
        .sync_all()
        .storage_context(|| "syncing archive")?;
    tmp.persist(&out_path)
        .map_err(|e| Error::storage(format!("writing {}", out_path.display()), e.error))?;
    debug!("packed {} entries into {}", entries.len(), out_path.display());
    Ok(())
}

/// Append an entry under exactly `name`; the tar crate would strip the `./`.
fn append_raw<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    data: R,
) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() > TAR_NAME_LEN {
        let mut long = tar::Header::new_gnu();
        long.as_old_mut().name[..GNU_LONG_NAME.len()].copy_from_slice(GNU_LONG_NAME);
        long.set_mode(0o644);
        long.set_uid(0);
        long.set_gid(0);
        long.set_mtime(0);
        long.set_size(bytes.len() as u64 + 1);
        long.set_entry_type(tar::EntryType::GNULongName);
        long.set_cksum();
        let mut payload = bytes.to_vec();
        payload.push(0);
        builder.append(&long, payload.as_slice())?;
        header
            .as_old_mut()
            .name
            .copy_from_slice(&bytes[..TAR_NAME_LEN]);
    } else {
        header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
    }
    header.set_cksum();
    builder.append(header, data)
}

/// Resolve an entry name against the destination, or `None` for the root itself.
fn clean_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafePath(raw.to_path_buf()))
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .storage_context(|| format!("creating {}", path.display()))
}

/// Write `target` from `data`, lifting a read-only parent for the duration.
fn write_file(target: &Path, mode: Option<u32>, mtime: Option<u64>, data: &mut dyn Read) -> Result<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    create_private_dir(parent)?;
    let parent_mode = fs::metadata(parent)
        .storage_context(|| format!("stat of {}", parent.display()))?
        .permissions()
        .mode();
    let lifted = parent_mode & 0o200 == 0;
    if lifted {
        fs::set_permissions(parent, fs::Permissions::from_mode(parent_mode | 0o700))
            .storage_context(|| format!("making {} writable", parent.display()))?;
    }
    let written = (|| -> Result<()> {
        let mut out = File::create(target).storage_context(|| format!("creating {}", target.display()))?;
        io::copy(data, &mut out).storage_context(|| format!("writing {}", target.display()))?;
        if let Some(mode) = mode {
            fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
                .storage_context(|| format!("setting mode of {}", target.display()))?;
        }
        if let Some(mtime) = mtime {
            out.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
                .storage_context(|| format!("setting mtime of {}", target.display()))?;
        }
        Ok(())
    })();
    if lifted {
        fs::set_permissions(parent, fs::Permissions::from_mode(parent_mode))
            .storage_context(|| format!("restoring mode of {}", parent.display()))?;
    }
    written
}

/// Extract `archive` into `dest`.
pub async fn unpack(archive: &Path, dest: &Path, options: UnpackOptions) -> Result<UnpackSummary> {
    let file = tokio::fs::File::open(archive)
        .await
        .storage_context(|| format!("opening {}", archive.display()))?;
    let mut magic = Vec::with_capacity(MAGIC_LEN);
    file.take(MAGIC_LEN as u64)
        .read_to_end(&mut magic)
        .await
        .storage_context(|| format!("reading {}", archive.display()))?;
    let format = detect_format(&magic);
    debug!("unpacking {} as {format:?}", archive.display());

    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || match format {
        ArchiveFormat::Zip => unpack_zip(&archive, &dest, options),
        _ => unpack_tar(&archive, &dest, format, options, &handle),
    })
    .await
    .map_err(join_error)?
}

fn bridge<R>(reader: R, handle: &Handle) -> Box<dyn Read>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::new(SyncIoBridge::new_with_handle(reader, handle.clone()))
}

fn async_buffered(file: File) -> tokio::io::BufReader<tokio::fs::File> {
    tokio::io::BufReader::new(tokio::fs::File::from_std(file))
}

fn open_tar(path: &Path, format: ArchiveFormat, handle: &Handle) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(path).storage_context(|| format!("opening {}", path.display()))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(BufReader::new(file)),
        ArchiveFormat::TarZstd => {
            Box::new(zstd::Decoder::new(file).storage_context(|| "starting zstd decoder")?)
        }
        ArchiveFormat::TarGzip => bridge(GzipDecoder::new(async_buffered(file)), handle),
        ArchiveFormat::TarBzip2 => bridge(BzDecoder::new(async_buffered(file)), handle),
        ArchiveFormat::TarXz => bridge(XzDecoder::new(async_buffered(file)), handle),
        ArchiveFormat::TarLz4 => bridge(Lz4Decoder::new(async_buffered(file)), handle),
        ArchiveFormat::TarBrotli => bridge(BrotliDecoder::new(async_buffered(file)), handle),
        ArchiveFormat::Zip => {
            return Err(Error::storage(
                format!("{} is a zip archive", path.display()),
                io::Error::from(io::ErrorKind::InvalidInput),
            ))
        }
    };
    Ok(tar::Archive::new(reader))
}

fn unpack_tar(
    path: &Path,
    dest: &Path,
    format: ArchiveFormat,
    options: UnpackOptions,
    handle: &Handle,
) -> Result<UnpackSummary> {
    let reading = || format!("reading {}", path.display());

    // validation pass: nothing is written unless every entry is acceptable
    let mut archive = open_tar(path, format, handle)?;
    for entry in archive.entries().storage_context(reading)? {
        let entry = entry.storage_context(reading)?;
        let raw = entry.path().storage_context(reading)?.into_owned();
        clean_entry_path(&raw)?;
        let kind = entry.header().entry_type();
        if options.reject_links && (kind.is_symlink() || kind.is_hard_link()) {
            return Err(Error::UnsafePath(raw));
        }
    }

    create_private_dir(dest)?;
    let mut summary = UnpackSummary::default();
    let mut directories = Vec::new();
    let mut archive = open_tar(path, format, handle)?;
    for entry in archive.entries().storage_context(reading)? {
        let mut entry = entry.storage_context(reading)?;
        let raw = entry.path().storage_context(reading)?.into_owned();
        let Some(relative) = clean_entry_path(&raw)? else {
            continue;
        };
        let target = dest.join(&relative);
        let header = entry.header();
        let mode = header.mode().ok();
        let mtime = header.mtime().ok();
        let kind = header.entry_type();
        if kind.is_dir() {
            create_private_dir(&target)?;
            directories.push((target, mode));
            summary.directories += 1;
        } else if kind.is_file() || kind == tar::EntryType::Continuous {
            write_file(&target, mode, mtime, &mut entry)?;
            summary.files += 1;
        } else if kind.is_symlink() || kind.is_hard_link() {
            warn!("skipping link {}", raw.display());
            summary.skipped_links += 1;
        } else {
            debug!("skipping {} of type {kind:?}", raw.display());
        }
    }
    apply_directory_modes(directories)?;
    Ok(summary)
}

fn apply_directory_modes(mut directories: Vec<(PathBuf, Option<u32>)>) -> Result<()> {
    // deepest first, so a read-only parent does not block its children
    directories.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, mode) in directories {
        if let Some(mode) = mode {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o7777))
                .storage_context(|| format!("setting mode of {}", dir.display()))?;
        }
    }
    Ok(())
}

fn zip_error(path: &Path, e: zip::result::ZipError) -> Error {
    Error::storage(format!("reading {}", path.display()), io::Error::other(e))
}

fn unpack_zip(path: &Path, dest: &Path, options: UnpackOptions) -> Result<UnpackSummary> {
    let file = File::open(path).storage_context(|| format!("opening {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| zip_error(path, e))?;

    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| zip_error(path, e))?;
        let raw = PathBuf::from(entry.name());
        if entry.enclosed_name().is_none() {
            return Err(Error::UnsafePath(raw));
        }
        clean_entry_path(&raw)?;
        let is_link = entry.unix_mode().is_some_and(|m| m & S_IFMT == S_IFLNK);
        if options.reject_links && is_link {
            return Err(Error::UnsafePath(raw));
        }
    }

    create_private_dir(dest)?;
    let mut summary = UnpackSummary::default();
    let mut directories = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| zip_error(path, e))?;
        let raw = PathBuf::from(entry.name());
        let Some(relative) = clean_entry_path(&raw)? else {
            continue;
        };
        let target = dest.join(&relative);
        let mode = entry.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            warn!("skipping link {}", raw.display());
            summary.skipped_links += 1;
        } else if entry.is_dir() {
            create_private_dir(&target)?;
            directories.push((target, mode));
            summary.directories += 1;
        } else {
            write_file(&target, mode, None, &mut entry)?;
            summary.files += 1;
        }
    }
    apply_directory_modes(directories)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::tempdir;

    fn tar_with_entry(name: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(&[0x1f, 0x8b, 8, 0]), ArchiveFormat::TarGzip);
        assert_eq!(detect_format(b"BZh91AY"), ArchiveFormat::TarBzip2);
        assert_eq!(detect_format(&[0x28, 0xb5, 0x2f, 0xfd, 0]), ArchiveFormat::TarZstd);
        assert_eq!(detect_format(b"PK\x03\x04rest"), ArchiveFormat::Zip);
        assert_eq!(detect_format(&tar_with_entry(b"a")), ArchiveFormat::Tar);
        assert_eq!(detect_format(b"\x8b\x02\x80"), ArchiveFormat::TarBrotli);
    }

    #[test]
    fn test_clean_entry_path() {
        assert_eq!(
            clean_entry_path(Path::new("./blobs/sha256/ab")).unwrap(),
            Some(PathBuf::from("blobs/sha256/ab"))
        );
        assert_eq!(clean_entry_path(Path::new("./")).unwrap(), None);
        for bad in ["../x", "a/../../x", "/etc/passwd", "a/.."] {
            assert!(matches!(
                clean_entry_path(Path::new(bad)),
                Err(Error::UnsafePath(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_pack_unpack_roundtrip() -> anyhow::Result<()> {
        let src = tempdir();
        let long_dir = src.path().join("blobs").join("sha512");
        std::fs::create_dir_all(&long_dir)?;
        let long_name = "f".repeat(128);
        std::fs::write(long_dir.join(&long_name), b"long")?;
        std::fs::write(src.path().join("index.json"), b"{}")?;
        std::fs::write(src.path().join("run.sh"), b"#!/bin/sh\n")?;
        std::fs::set_permissions(src.path().join("run.sh"), fs::Permissions::from_mode(0o755))?;
        std::fs::write(long_dir.join(".tmp-inflight"), b"partial")?;

        let out_dir = tempdir();
        let out = out_dir.path().join("out.tar.zst");
        std::fs::write(&out, b"stale")?;
        pack(src.path(), &out).await?;

        let raw = zstd::decode_all(File::open(&out)?)?;
        let mut names = Vec::new();
        for entry in tar::Archive::new(raw.as_slice()).entries()? {
            names.push(entry?.path()?.to_string_lossy().into_owned());
        }
        similar_asserts::assert_eq!(
            names,
            vec![
                "./blobs/".to_string(),
                "./blobs/sha512/".to_string(),
                format!("./blobs/sha512/{long_name}"),
                "./index.json".to_string(),
                "./run.sh".to_string(),
            ]
        );

        let dest = tempdir();
        let summary = unpack(&out, dest.path(), UnpackOptions::default()).await?;
        assert_eq!(summary.files, 3);
        assert_eq!(std::fs::read(dest.path().join("blobs/sha512").join(&long_name))?, b"long");
        let mode = std::fs::metadata(dest.path().join("run.sh"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!dest.path().join("blobs/sha512/.tmp-inflight").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unpack_rejects_parent_dir_before_writing() -> anyhow::Result<()> {
        let dir = tempdir();
        let mut builder = tar::Builder::new(Vec::new());
        let mut good = tar::Header::new_gnu();
        good.set_size(2);
        good.set_mode(0o644);
        good.set_entry_type(tar::EntryType::Regular);
        good.as_old_mut().name[..6].copy_from_slice(b"./good");
        good.set_cksum();
        builder.append(&good, &b"ok"[..])?;
        let mut bad = tar::Header::new_gnu();
        bad.set_size(4);
        bad.set_mode(0o644);
        bad.set_entry_type(tar::EntryType::Regular);
        bad.as_old_mut().name[..9].copy_from_slice(b"../escape");
        bad.set_cksum();
        builder.append(&bad, &b"evil"[..])?;
        let archive = dir.path().join("bad.tar");
        std::fs::write(&archive, builder.into_inner()?)?;

        let dest = dir.path().join("dest");
        let err = unpack(&archive, &dest, UnpackOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsafePath(_)));
        assert!(!dest.join("good").exists());
        assert!(!dir.path().join("escape").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unpack_gzip_skips_links() -> anyhow::Result<()> {
        use flate2::write::GzEncoder;

        let dir = tempdir();
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), flate2::Compression::default()));
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o600);
        file.set_entry_type(tar::EntryType::Regular);
        file.set_cksum();
        builder.append_data(&mut file, "data/file", &b"hello"[..])?;
        let mut link = tar::Header::new_gnu();
        link.set_size(0);
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_cksum();
        builder.append_link(&mut link, "data/link", "/etc/passwd")?;
        let archive = dir.path().join("store.tar.gz");
        std::fs::write(&archive, builder.into_inner()?.finish()?)?;

        let dest = dir.path().join("lenient");
        let summary = unpack(&archive, &dest, UnpackOptions::default()).await?;
        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped_links, 1);
        assert_eq!(std::fs::read(dest.join("data/file"))?, b"hello");
        assert!(std::fs::symlink_metadata(dest.join("data/link")).is_err());
        let parent_mode = std::fs::metadata(dest.join("data"))?.permissions().mode();
        assert_eq!(parent_mode & 0o777, 0o700);

        let strict = UnpackOptions { reject_links: true };
        assert!(matches!(
            unpack(&archive, &dir.path().join("strict"), strict).await,
            Err(Error::UnsafePath(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unpack_zip() -> anyhow::Result<()> {
        let dir = tempdir();
        let archive = dir.path().join("store.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&archive)?);
            let options = zip::write::SimpleFileOptions::default();
            writer.add_directory("blobs/", options.unix_permissions(0o755))?;
            writer.start_file("blobs/data", options.unix_permissions(0o640))?;
            writer.write_all(b"zipped")?;
            writer.finish()?;
        }
        let dest = dir.path().join("dest");
        let summary = unpack(&archive, &dest, UnpackOptions::default()).await?;
        assert_eq!(summary.files, 1);
        assert_eq!(std::fs::read(dest.join("blobs/data"))?, b"zipped");
        Ok(())
    }
}
