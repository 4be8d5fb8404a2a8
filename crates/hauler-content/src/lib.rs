//! Artifact builders and the signature layer.
//!
//! A [`Source`] describes something to pull into a store: a registry image,
//! a Helm chart, a file or a collection of those. Building a source yields
//! one or more [`Built`] artifacts whose layers are read lazily, so nothing
//! is downloaded until [`hauler::Store::add`] streams it into a staging
//! layout.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use hauler::{Artifact, Descriptor, Reference, Store};
use hauler_registry::{RegistryClient, RetryPolicy};

pub mod chart;
pub mod collection;
pub mod discovery;
mod download;
pub mod file;
pub mod image;
pub mod signature;

pub use chart::{ChartSource, HelmTemplater, Templater};
pub use collection::{Collection, Distribution};
pub use file::FileSource;
pub use image::{ImageSource, PlatformSelector};
pub use signature::{Attachment, CosignCli, Signer, Verifier};

/// One artifact ready to be added, with the reference it is stored under.
#[derive(Debug, Clone)]
pub struct Built {
    /// Store reference.
    pub reference: Reference,
    /// Manifest, config and lazily read layers.
    pub artifact: Artifact,
}

/// Everything a build can pull from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A registry image or index.
    Image(ImageSource),
    /// A Helm chart.
    Chart(ChartSource),
    /// A local or remote file.
    File(FileSource),
    /// A distribution bundle or image list.
    Collection(Collection),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Image(s) => write!(f, "image {}", s.name),
            Source::Chart(s) => write!(f, "chart {}", s.name),
            Source::File(s) => write!(f, "file {}", s.path),
            Source::Collection(c) => write!(f, "collection {c}"),
        }
    }
}

impl Source {
    /// Resolve the source into artifacts.
    ///
    /// Images come with any requested cosign companions, charts with the
    /// images discovered in their templates, collections with every item.
    pub async fn build(&self, ctx: &BuildContext) -> Result<Vec<Built>> {
        match self {
            Source::Image(source) => image::build(ctx, source).await,
            Source::Chart(source) => chart::build(ctx, source).await,
            Source::File(source) => Ok(vec![file::build(ctx, source).await?]),
            Source::Collection(collection) => collection::build(ctx, collection).await,
        }
    }
}

/// Build `source` and add every result to `store`.
///
/// Layers are fetched during the add, so network failures surface here as
/// [`hauler::Error::SourceUnavailable`].
pub async fn add(
    store: &Store,
    ctx: &BuildContext,
    source: &Source,
    cancel: &CancellationToken,
) -> Result<Vec<Descriptor>> {
    let built = source
        .build(ctx)
        .await
        .with_context(|| format!("Building {source}"))?;
    let mut added = Vec::with_capacity(built.len());
    for Built {
        reference,
        artifact,
    } in built
    {
        let descriptor = store
            .add_with_cancel(&artifact, &reference, cancel)
            .await
            .with_context(|| format!("Adding {reference}"))?;
        added.push(descriptor);
    }
    Ok(added)
}

/// Shared state for builds.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Client for registry pulls.
    pub registry: RegistryClient,
    /// Client for plain HTTP downloads (chart repositories, files).
    pub http: reqwest::Client,
    /// Retry policy for every remote fetch.
    pub retry: RetryPolicy,
    /// Renders charts for image discovery.
    pub templater: Arc<dyn Templater>,
    /// Platform picked from image indexes when a source names none.
    pub platform: Option<PlatformSelector>,
    scratch: Arc<TempDir>,
}

impl BuildContext {
    /// A context whose downloads land in a fresh directory under `tmp_dir`.
    ///
    /// The directory lives as long as the last clone of the context, which
    /// must outlive the adds of everything built with it.
    pub fn new(registry: RegistryClient, tmp_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(tmp_dir)
            .with_context(|| format!("Creating {}", tmp_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("hauler-build-")
            .tempdir_in(tmp_dir)
            .with_context(|| format!("Creating build directory in {}", tmp_dir.display()))?;
        Ok(BuildContext {
            http: registry.http().clone(),
            registry,
            retry: RetryPolicy::default(),
            templater: Arc::new(HelmTemplater::default()),
            platform: None,
            scratch: Arc::new(scratch),
        })
    }

    /// Use `retry` for remote fetches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use `templater` for chart image discovery.
    pub fn with_templater(mut self, templater: Arc<dyn Templater>) -> Self {
        self.templater = templater;
        self
    }

    /// Default platform for image indexes.
    pub fn with_platform(mut self, platform: PlatformSelector) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Directory for downloads and other build scratch files.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Map `s` onto the characters a repository component allows.
fn sanitize(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// `hauler/<name>:<tag>` for artifacts that have no registry of their own.
///
/// The name is lowercased and anything a repository component cannot hold
/// becomes `-`; `+` in the tag (as in `v1.30.0+k3s1`) becomes `-` too.
/// Without a tag the reference is tagged `latest`.
pub fn native_reference(name: &str, tag: Option<&str>) -> Result<Reference> {
    let component = sanitize(name);
    if component.is_empty() {
        return Err(hauler::Error::InvalidReference(name.to_string()).into());
    }
    let reference = Reference::with_default_namespace(&component)?;
    match tag {
        Some(tag) => Ok(reference.with_tag(&tag.replace('+', "-"))?),
        None => Ok(reference.or_latest()),
    }
}

/// Recover a store error from an anyhow chain, or report `origin` as unavailable.
pub(crate) fn into_store_error(origin: &str, err: anyhow::Error) -> hauler::Error {
    match err.downcast::<hauler::Error>() {
        Ok(err) => err,
        Err(err) => hauler::Error::SourceUnavailable {
            origin: origin.to_string(),
            cause: err.into(),
        },
    }
}
