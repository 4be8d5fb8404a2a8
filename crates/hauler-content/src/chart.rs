//! Helm charts.
//!
//! A chart is stored as a single-layer artifact: the packaged `.tgz`
//! untouched, with `Chart.yaml` converted to JSON as the config. Charts come
//! from an HTTP repository (`index.yaml`), an `oci://` registry or a local
//! package.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fn_error_context::context;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use hauler::descriptor::{ANNOTATION_TITLE, MEDIA_TYPE_CHART_CONFIG, MEDIA_TYPE_CHART_LAYER};
use hauler::{Artifact, Descriptor, Kind, Layer, Manifest, ManifestDocument, Reference};

use crate::download::fetch_bytes;
use crate::image::{self, fetch_manifest, ImageSource};
use crate::{native_reference, BuildContext, Built};

/// A chart to store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChartSource {
    /// Chart name, or the package path when `repo` is unset.
    pub name: String,
    /// `https://` repository or `oci://` registry path.
    pub repo: Option<String>,
    /// Exact version; the highest stable version when unset.
    pub version: Option<String>,
    /// Render the chart and add the images it references.
    pub add_images: bool,
}

/// Renders a packaged chart to Kubernetes YAML.
#[async_trait]
pub trait Templater: Send + Sync + fmt::Debug {
    /// Render `chart` with its default values under release name `release`.
    async fn template(&self, release: &str, chart: &Path) -> Result<String>;
}

/// Runs `helm template`.
#[derive(Debug, Clone)]
pub struct HelmTemplater {
    /// The helm executable.
    pub binary: PathBuf,
}

impl Default for HelmTemplater {
    fn default() -> Self {
        HelmTemplater {
            binary: PathBuf::from("helm"),
        }
    }
}

#[async_trait]
impl Templater for HelmTemplater {
    async fn template(&self, release: &str, chart: &Path) -> Result<String> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("template")
            .arg(release)
            .arg(chart)
            .output()
            .await
            .with_context(|| format!("Spawning {}", self.binary.display()))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

/// The fields of `Chart.yaml` a store needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name.
    pub name: String,
    /// Chart version.
    pub version: String,
    /// Version of the packaged application.
    #[serde(default)]
    pub app_version: Option<String>,
}

/// `Chart.yaml` of a packaged chart, as a YAML value.
///
/// Only the top-level chart counts; subcharts under `charts/` are ignored.
pub fn read_chart_yaml(package: &[u8]) -> Result<serde_yaml::Value> {
    let mut archive = tar::Archive::new(GzDecoder::new(package));
    for entry in archive.entries().context("Reading chart package")? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let components: Vec<_> = path.components().collect();
        if components.len() == 2 && path.file_name().is_some_and(|n| n == "Chart.yaml") {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return serde_yaml::from_str(&contents).context("Parsing Chart.yaml");
        }
    }
    bail!("chart package has no Chart.yaml")
}

#[derive(Debug, Default, Deserialize)]
struct RepoIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<RepoEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepoEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

fn parse_version(v: &str) -> Option<semver::Version> {
    semver::Version::parse(v.strip_prefix('v').unwrap_or(v)).ok()
}

/// The entry for `wanted`, or the highest stable semver when `wanted` is unset.
fn pick_version<'a>(entries: &'a [RepoEntry], wanted: Option<&str>) -> Option<&'a RepoEntry> {
    match wanted {
        Some(wanted) => {
            let trimmed = wanted.strip_prefix('v').unwrap_or(wanted);
            entries.iter().find(|e| {
                e.version == wanted || e.version.strip_prefix('v').unwrap_or(&e.version) == trimmed
            })
        }
        None => entries
            .iter()
            .filter_map(|e| parse_version(&e.version).map(|v| (v, e)))
            .filter(|(v, _)| v.pre.is_empty())
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, e)| e),
    }
}

fn repo_base(repo: &str) -> Result<Url> {
    let base = format!("{}/", repo.trim_end_matches('/'));
    Url::parse(&base).with_context(|| format!("Parsing repository URL {repo}"))
}

#[context("Fetching chart {} from {repo}", source.name)]
async fn fetch_from_repo(ctx: &BuildContext, repo: &str, source: &ChartSource) -> Result<Bytes> {
    let base = repo_base(repo)?;
    let index_url = base.join("index.yaml")?;
    let index: RepoIndex = serde_yaml::from_slice(&fetch_bytes(ctx, &index_url).await?)
        .with_context(|| format!("Parsing {index_url}"))?;
    let entries = index
        .entries
        .get(&source.name)
        .ok_or_else(|| hauler::Error::ReferenceNotFound(format!("{repo}/{}", source.name)))?;
    let entry = pick_version(entries, source.version.as_deref()).ok_or_else(|| {
        hauler::Error::ReferenceNotFound(format!(
            "{repo}/{}:{}",
            source.name,
            source.version.as_deref().unwrap_or("<stable>")
        ))
    })?;
    let url = entry
        .urls
        .first()
        .ok_or_else(|| anyhow!("{} {} lists no download URL", source.name, entry.version))?;
    let url = base.join(url)?;
    debug!("fetching chart {} {} from {url}", source.name, entry.version);
    fetch_bytes(ctx, &url).await
}

async fn fetch_from_registry(ctx: &BuildContext, path: &str, source: &ChartSource) -> Result<Bytes> {
    let version = source
        .version
        .as_deref()
        .ok_or_else(|| anyhow!("a version is required for oci:// charts"))?;
    let reference: Reference = format!(
        "{}/{}:{}",
        path.trim_end_matches('/'),
        source.name,
        version.replace('+', "_")
    )
    .parse()?;
    let manifest = fetch_manifest(ctx, &reference).await?;
    let ManifestDocument::Manifest(document) = manifest.document()? else {
        bail!("{reference} is an image index, not a chart");
    };
    let layer = document
        .layers
        .iter()
        .find(|l| l.media_type == MEDIA_TYPE_CHART_LAYER)
        .ok_or_else(|| anyhow!("{reference} has no chart layer"))?;
    ctx.retry
        .run(&reference.to_string(), || {
            ctx.registry.fetch_blob_bytes(&reference, &layer.digest)
        })
        .await
}

async fn fetch_local(path: &str) -> Result<Bytes> {
    let path = match path.strip_prefix("file://") {
        Some(rest) => PathBuf::from(rest),
        None => PathBuf::from(path),
    };
    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Reading {}", path.display()))?;
    Ok(data.into())
}

/// Wrap a packaged chart as an artifact and name it `hauler/<name>:<version>`.
///
/// The tag is the `version` from `Chart.yaml` as written, `v` prefix
/// included, whatever version string selected the chart. This is the tag
/// `helm push` would use and matches the packaged file name. Only `+`
/// becomes `-`.
pub fn chart_artifact(package: Bytes) -> Result<(Built, ChartMetadata)> {
    let chart_yaml = read_chart_yaml(&package)?;
    let metadata: ChartMetadata =
        serde_yaml::from_value(chart_yaml.clone()).context("Chart.yaml lacks name or version")?;
    let config = Bytes::from(serde_json::to_vec(&chart_yaml)?);
    let layer = Layer::from_bytes(MEDIA_TYPE_CHART_LAYER, package).with_annotation(
        ANNOTATION_TITLE,
        format!("{}-{}.tgz", metadata.name, metadata.version),
    );
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_CHART_CONFIG, &config),
        vec![layer.descriptor.clone()],
    );
    let artifact = Artifact::from_manifest(&manifest, config, vec![layer])?.with_kind(Kind::Chart);
    let reference = native_reference(&metadata.name, Some(&metadata.version))?;
    Ok((
        Built {
            reference,
            artifact,
        },
        metadata,
    ))
}

/// Images the rendered chart references.
async fn discover_images(ctx: &BuildContext, package: &Bytes, metadata: &ChartMetadata) -> Result<Vec<String>> {
    let path = ctx
        .scratch_dir()
        .join(format!("{}-{}.tgz", metadata.name, metadata.version));
    tokio::fs::write(&path, package)
        .await
        .with_context(|| format!("Writing {}", path.display()))?;
    let rendered = ctx.templater.template(&metadata.name, &path).await?;
    crate::discovery::find_images(&rendered)
}

/// Fetch the chart and, when asked, the images it uses.
///
/// Failing to render the chart does not fail the build: the chart is still
/// returned, without images.
pub async fn build(ctx: &BuildContext, source: &ChartSource) -> Result<Vec<Built>> {
    let package = match source.repo.as_deref() {
        Some(repo) => match repo.strip_prefix("oci://") {
            Some(path) => fetch_from_registry(ctx, path, source).await?,
            None => fetch_from_repo(ctx, repo, source).await?,
        },
        None => fetch_local(&source.name).await?,
    };
    let (chart, metadata) = chart_artifact(package.clone())?;
    let mut built = vec![chart];
    if !source.add_images {
        return Ok(built);
    }

    let images = match discover_images(ctx, &package, &metadata).await {
        Ok(images) => images,
        Err(e) => {
            warn!("image discovery for {} failed, discovered=0: {e:#}", built[0].reference);
            return Ok(built);
        }
    };
    info!("discovered {} images in {}", images.len(), built[0].reference);
    for name in images {
        built.extend(image::build(ctx, &ImageSource::new(name)).await?);
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// A packaged chart with the given files next to its `Chart.yaml`.
    fn package(name: &str, version: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let chart_yaml = format!("apiVersion: v2\nname: {name}\nversion: {version}\nappVersion: \"1.0\"\n");
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut entries = vec![("Chart.yaml".to_string(), chart_yaml)];
        entries.extend(files.iter().map(|(p, c)| (p.to_string(), c.to_string())));
        entries.push((
            "charts/sub/Chart.yaml".to_string(),
            "apiVersion: v2\nname: sub\nversion: 9.9.9\n".to_string(),
        ));
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{name}/{path}"), contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_chart_artifact() -> Result<()> {
        let tgz = package("cert-manager", "1.15.3", &[("values.yaml", "replicas: 1\n")]);
        let (built, metadata) = chart_artifact(Bytes::from(tgz.clone()))?;
        assert_eq!(metadata.name, "cert-manager");
        assert_eq!(metadata.app_version.as_deref(), Some("1.0"));
        assert_eq!(built.reference.to_string(), "hauler/cert-manager:1.15.3");
        assert_eq!(built.artifact.kind(), Kind::Chart);

        let layer = &built.artifact.layers[0].descriptor;
        assert_eq!(layer.size, tgz.len() as u64);
        assert_eq!(layer.title(), Some("cert-manager-1.15.3.tgz"));
        let config = built.artifact.config.as_ref().unwrap();
        assert_eq!(config.descriptor.media_type, MEDIA_TYPE_CHART_CONFIG);
        Ok(())
    }

    #[test]
    fn test_chart_tag_follows_chart_yaml() -> Result<()> {
        let (built, _) = chart_artifact(Bytes::from(package("cert-manager", "v1.15.3", &[])))?;
        assert_eq!(built.reference.to_string(), "hauler/cert-manager:v1.15.3");
        assert_eq!(
            built.artifact.layers[0].descriptor.title(),
            Some("cert-manager-v1.15.3.tgz")
        );

        let (built, _) = chart_artifact(Bytes::from(package("rancher", "2.9.0+up1", &[])))?;
        assert_eq!(built.reference.to_string(), "hauler/rancher:2.9.0-up1");
        Ok(())
    }

    #[test]
    fn test_config_is_chart_yaml_as_json() -> Result<()> {
        let tgz = package("demo", "0.1.0", &[]);
        let value = read_chart_yaml(&tgz)?;
        similar_asserts::assert_eq!(
            serde_json::to_value(&value)?,
            serde_json::json!({
                "apiVersion": "v2",
                "name": "demo",
                "version": "0.1.0",
                "appVersion": "1.0"
            })
        );
        Ok(())
    }

    #[test]
    fn test_missing_chart_yaml() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_cksum();
        builder.append_data(&mut header, "x/values.yaml", &b"{}"[..]).unwrap();
        let tgz = builder.into_inner().unwrap().finish().unwrap();
        assert!(read_chart_yaml(&tgz).is_err());
    }

    #[test]
    fn test_pick_version() {
        let entries: Vec<RepoEntry> = ["v1.14.5", "v1.15.3", "v1.16.0-alpha.0", "v1.9.0", "latest"]
            .iter()
            .map(|v| RepoEntry {
                version: v.to_string(),
                urls: vec![],
            })
            .collect();
        assert_eq!(pick_version(&entries, None).unwrap().version, "v1.15.3");
        assert_eq!(pick_version(&entries, Some("1.14.5")).unwrap().version, "v1.14.5");
        assert_eq!(pick_version(&entries, Some("v1.9.0")).unwrap().version, "v1.9.0");
        assert!(pick_version(&entries, Some("2.0.0")).is_none());
        assert!(pick_version(&[], None).is_none());
    }
}
