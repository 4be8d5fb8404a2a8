//! Arbitrary files, local or downloaded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;
use url::Url;

use hauler::artifact::FileOpener;
use hauler::descriptor::{
    ANNOTATION_SOURCE, ANNOTATION_TITLE, MEDIA_TYPE_FILE_CONFIG, MEDIA_TYPE_FILE_LAYER,
};
use hauler::{Artifact, Descriptor, Digest, Kind, Layer, Manifest};

use crate::download::fetch_to_file;
use crate::{native_reference, BuildContext, Built};

/// A file to store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSource {
    /// Local path, `file://` URL or `http(s)://` URL.
    pub path: String,
    /// Name to store and extract the file under.
    pub name: Option<String>,
    /// Tag; `latest` when unset.
    pub tag: Option<String>,
}

impl FileSource {
    /// Store `path` under its own name.
    pub fn new(path: impl Into<String>) -> Self {
        FileSource {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Store under `name` instead.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Tag with `tag` instead of `latest`.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

#[derive(Serialize)]
struct FileConfig<'a> {
    reference: String,
    name: &'a str,
    annotations: &'a BTreeMap<String, String>,
    urls: Vec<&'a str>,
}

enum Location {
    Local(PathBuf),
    Remote(Url),
}

fn locate(path: &str) -> Result<Location> {
    if path.starts_with("http://") || path.starts_with("https://") {
        let url = Url::parse(path).with_context(|| format!("Parsing URL {path}"))?;
        return Ok(Location::Remote(url));
    }
    if path.starts_with("file://") {
        let url = Url::parse(path).with_context(|| format!("Parsing URL {path}"))?;
        let local = url
            .to_file_path()
            .map_err(|()| anyhow!("{path} does not name a local file"))?;
        return Ok(Location::Local(local));
    }
    Ok(Location::Local(PathBuf::from(path)))
}

/// Last non-empty path segment of `url`.
fn url_filename(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build the single-layer artifact for `source`.
pub async fn build(ctx: &BuildContext, source: &FileSource) -> Result<Built> {
    let (layer, name) = match locate(&source.path)? {
        Location::Local(path) => {
            let layer = Layer::from_file(&path, MEDIA_TYPE_FILE_LAYER)
                .await
                .with_context(|| format!("Reading {}", path.display()))?;
            let name = source
                .name
                .clone()
                .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| anyhow!("cannot derive a file name from {}", source.path))?;
            (layer, name)
        }
        Location::Remote(url) => {
            let dest = ctx
                .scratch_dir()
                .join(format!("download-{}", Digest::sha256(url.as_str().as_bytes()).hex()));
            let download = fetch_to_file(ctx, &url, &dest).await?;
            debug!("downloaded {url} ({} bytes)", download.size);
            let name = source
                .name
                .clone()
                .or(download.filename)
                .or_else(|| url_filename(&url))
                .ok_or_else(|| anyhow!("cannot derive a file name from {url}"))?;
            let descriptor = Descriptor::new(MEDIA_TYPE_FILE_LAYER, download.digest, download.size);
            (Layer::new(descriptor, FileOpener::new(dest)), name)
        }
    };

    let reference = native_reference(&name, source.tag.as_deref())?;
    let layer = layer
        .with_annotation(ANNOTATION_TITLE, name.as_str())
        .with_annotation(ANNOTATION_SOURCE, source.path.as_str());
    let config = serde_json::to_vec(&FileConfig {
        reference: reference.to_string(),
        name: &name,
        annotations: &layer.descriptor.annotations,
        urls: vec![source.path.as_str()],
    })?;
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_FILE_CONFIG, &config),
        vec![layer.descriptor.clone()],
    );
    let artifact = Artifact::from_manifest(&manifest, Bytes::from(config), vec![layer])?
        .with_kind(Kind::File);
    Ok(Built {
        reference,
        artifact,
    })
}
