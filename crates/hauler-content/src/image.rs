//! Registry images.
//!
//! Manifests and configs are stored verbatim so digests survive the trip.
//! An image index is either narrowed to one platform or stored whole with
//! every child manifest it lists.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Arch, ImageIndex as OciImageIndex, Os};
use tracing::{debug, info};

use hauler::descriptor::ANNOTATION_SUBJECT;
use hauler::kind::cosign_tag;
use hauler::{
    Artifact, BlobReader, Descriptor, Digest, Kind, Layer, ManifestDocument, Opener, Reference,
};
use hauler_registry::client::DOCKER_HUB_HOST;
use hauler_registry::{RegistryClient, RemoteManifest, RetryPolicy};

use crate::{into_store_error, BuildContext, Built};

/// An image to pull.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageSource {
    /// Registry reference, e.g. `rancher/k3s:v1.30.0-k3s1`.
    pub name: String,
    /// `os/arch[/variant]` to pick out of an index.
    pub platform: Option<String>,
    /// Also pull `.sig`, `.att` and `.sbom` companions.
    pub signatures: bool,
}

impl ImageSource {
    /// Pull `name` as is.
    pub fn new(name: impl Into<String>) -> Self {
        ImageSource {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// An `os/arch[/variant]` platform filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSelector {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub architecture: Arch,
    /// Architecture variant; any variant matches when unset.
    pub variant: Option<String>,
}

impl PlatformSelector {
    fn matches(&self, platform: &oci_spec::image::Platform) -> bool {
        *platform.os() == self.os
            && *platform.architecture() == self.architecture
            && self
                .variant
                .as_ref()
                .is_none_or(|v| platform.variant().as_ref() == Some(v))
    }
}

impl FromStr for PlatformSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let (Some(os), Some(arch)) = (parts.next(), parts.next()) else {
            bail!("invalid platform {s:?}: expected os/arch[/variant]");
        };
        let variant = parts.next().map(str::to_string);
        if os.is_empty() || arch.is_empty() || parts.next().is_some() {
            bail!("invalid platform {s:?}: expected os/arch[/variant]");
        }
        Ok(PlatformSelector {
            os: Os::from(os),
            architecture: Arch::from(arch),
            variant,
        })
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Opens a remote blob, retrying the request.
#[derive(Debug, Clone)]
struct RemoteBlob {
    client: RegistryClient,
    retry: RetryPolicy,
    reference: Reference,
    digest: Digest,
}

#[async_trait]
impl Opener for RemoteBlob {
    async fn open(&self) -> hauler::Result<BlobReader> {
        let origin = format!("{}@{}", self.reference.name(), self.digest);
        self.retry
            .run(&origin, || self.client.fetch_blob(&self.reference, &self.digest))
            .await
            .map_err(|e| into_store_error(&origin, e))
    }
}

fn remote_layer(ctx: &BuildContext, reference: &Reference, descriptor: &Descriptor) -> Layer {
    Layer::new(
        descriptor.clone(),
        RemoteBlob {
            client: ctx.registry.clone(),
            retry: ctx.retry,
            reference: reference.clone(),
            digest: descriptor.digest.clone(),
        },
    )
}

/// The reference an image is stored under.
///
/// Docker Hub images drop the host and gain the `library/` namespace
/// (`busybox:1.34.1` becomes `library/busybox:1.34.1`); images from any
/// other registry keep it.
pub fn store_reference(remote: &Reference) -> Result<Reference> {
    let hub = matches!(
        remote.registry(),
        None | Some("docker.io") | Some("index.docker.io") | Some(DOCKER_HUB_HOST)
    );
    if !hub {
        return Ok(remote.clone().or_latest());
    }
    let repository = if remote.repository().contains('/') {
        remote.repository().to_string()
    } else {
        format!("library/{}", remote.repository())
    };
    let reference = Reference::new(None, &repository, remote.tag(), remote.digest().cloned())?;
    Ok(reference.or_latest())
}

pub(crate) async fn fetch_manifest(ctx: &BuildContext, reference: &Reference) -> Result<RemoteManifest> {
    ctx.retry
        .run(&reference.to_string(), || ctx.registry.resolve_manifest(reference))
        .await
}

/// An artifact for a single (non-index) manifest.
fn manifest_artifact(ctx: &BuildContext, remote: &Reference, manifest: &RemoteManifest) -> Result<Artifact> {
    let ManifestDocument::Manifest(document) = manifest.document()? else {
        bail!("{remote} is an image index");
    };
    let layers = document
        .layers
        .iter()
        .map(|d| remote_layer(ctx, remote, d))
        .collect();
    Ok(Artifact::new(manifest.media_type.clone(), manifest.data.clone())
        .with_algorithm(manifest.digest.algorithm())
        .with_config(remote_layer(ctx, remote, &document.config))
        .with_layers(layers))
}

/// An artifact for a whole index: the child manifests travel as layers
/// together with their configs and layers.
async fn index_artifact(
    ctx: &BuildContext,
    remote: &Reference,
    manifest: &RemoteManifest,
    children: &[Descriptor],
) -> Result<Artifact> {
    let mut layers = Vec::new();
    for child in children {
        let pinned = remote.with_digest(child.digest.clone());
        let child_manifest = fetch_manifest(ctx, &pinned).await?;
        match child_manifest.document()? {
            ManifestDocument::Manifest(document) => {
                layers.push(remote_layer(ctx, remote, &document.config));
                layers.extend(document.layers.iter().map(|d| remote_layer(ctx, remote, d)));
            }
            ManifestDocument::Index(_) => {
                debug!("{pinned}: nested index stored without its children");
            }
        }
        layers.push(Layer::new(
            child.clone(),
            hauler::artifact::BytesOpener::new(child_manifest.data),
        ));
    }
    Ok(Artifact::new(manifest.media_type.clone(), manifest.data.clone())
        .with_algorithm(manifest.digest.algorithm())
        .with_layers(layers))
}

/// Pick the index child matching `platform` out of an index body.
fn select_platform(data: &Bytes, platform: &PlatformSelector) -> Result<Digest> {
    let index = OciImageIndex::from_reader(&data[..]).context("Parsing image index")?;
    let child = index
        .manifests()
        .iter()
        .find(|d| d.platform().as_ref().is_some_and(|p| platform.matches(p)));
    let Some(child) = child else {
        let available: Vec<String> = index
            .manifests()
            .iter()
            .filter_map(|d| {
                d.platform()
                    .as_ref()
                    .map(|p| format!("{}/{}", p.os(), p.architecture()))
            })
            .collect();
        bail!(
            "no manifest for platform {platform}; available: {}",
            available.join(", ")
        );
    };
    Ok(child.digest().to_string().parse()?)
}

/// Resolve an image (and its companions) into artifacts.
pub async fn build(ctx: &BuildContext, source: &ImageSource) -> Result<Vec<Built>> {
    let remote: Reference = source
        .name
        .parse()
        .with_context(|| format!("Parsing image reference {}", source.name))?;
    let mut stored = store_reference(&remote)?;
    let platform = match &source.platform {
        Some(p) => Some(p.parse::<PlatformSelector>()?),
        None => ctx.platform.clone(),
    };

    let mut manifest = fetch_manifest(ctx, &remote).await?;
    let artifact = match (manifest.document()?, platform) {
        (ManifestDocument::Index(_), Some(platform)) => {
            let child = select_platform(&manifest.data, &platform)?;
            debug!("{remote}: selected {child} for {platform}");
            manifest = fetch_manifest(ctx, &remote.with_digest(child.clone())).await?;
            if stored.digest().is_some() {
                stored = stored.with_digest(child);
            }
            manifest_artifact(ctx, &remote, &manifest)?
        }
        (ManifestDocument::Index(index), None) => {
            index_artifact(ctx, &remote, &manifest, &index.manifests).await?
        }
        (ManifestDocument::Manifest(_), _) => manifest_artifact(ctx, &remote, &manifest)?,
    };
    info!("resolved {remote} to {}", manifest.digest);

    let mut built = vec![Built {
        reference: stored.clone(),
        artifact,
    }];
    if source.signatures {
        built.extend(companions(ctx, &remote, &stored, &manifest.digest).await?);
    }
    Ok(built)
}

/// The cosign signature, attestation and SBOM attached to `subject`, if published.
async fn companions(
    ctx: &BuildContext,
    remote: &Reference,
    stored: &Reference,
    subject: &Digest,
) -> Result<Vec<Built>> {
    let mut found = Vec::new();
    for kind in [Kind::Signature, Kind::Attestation, Kind::Sbom] {
        let Some(tag) = cosign_tag(subject, kind) else {
            continue;
        };
        let companion = Reference::new(remote.registry(), remote.repository(), Some(&tag), None)?;
        let manifest = match fetch_manifest(ctx, &companion).await {
            Ok(manifest) => manifest,
            Err(e) if e.downcast_ref::<hauler::Error>().is_some_and(|e| e.is_not_found()) => {
                debug!("{companion}: not published");
                continue;
            }
            Err(e) => return Err(e),
        };
        let artifact = manifest_artifact(ctx, &companion, &manifest)?
            .with_kind(kind)
            .with_annotation(ANNOTATION_SUBJECT, subject.to_string());
        found.push(Built {
            reference: Reference::new(stored.registry(), stored.repository(), Some(&tag), None)?,
            artifact,
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_selector() -> Result<()> {
        let p: PlatformSelector = "linux/arm64/v8".parse()?;
        assert_eq!(p.os, Os::Linux);
        assert_eq!(p.architecture, Arch::from("arm64"));
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert_eq!("linux/amd64".parse::<PlatformSelector>()?.variant, None);
        for bad in ["linux", "linux/", "/amd64", "a/b/c/d"] {
            assert!(bad.parse::<PlatformSelector>().is_err(), "{bad}");
        }
        Ok(())
    }

    #[test]
    fn test_store_reference() -> Result<()> {
        let cases = [
            ("busybox:1.34.1", "library/busybox:1.34.1"),
            ("docker.io/rancher/k3s:v1.30.0-k3s1", "rancher/k3s:v1.30.0-k3s1"),
            ("quay.io/jetstack/cert-manager-controller:v1.15.3", "quay.io/jetstack/cert-manager-controller:v1.15.3"),
            ("localhost:5000/team/app", "localhost:5000/team/app:latest"),
        ];
        for (input, expected) in cases {
            assert_eq!(store_reference(&input.parse()?)?.to_string(), expected);
        }
        Ok(())
    }

    #[test]
    fn test_select_platform() -> Result<()> {
        let amd = Digest::sha256(b"amd64");
        let arm = Digest::sha256(b"arm64");
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": amd.to_string(),
                    "size": 10,
                    "platform": { "os": "linux", "architecture": "amd64" }
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": arm.to_string(),
                    "size": 10,
                    "platform": { "os": "linux", "architecture": "arm64", "variant": "v8" }
                }
            ]
        });
        let data = Bytes::from(serde_json::to_vec(&index)?);
        assert_eq!(select_platform(&data, &"linux/amd64".parse()?)?, amd);
        assert_eq!(select_platform(&data, &"linux/arm64".parse()?)?, arm);
        assert_eq!(select_platform(&data, &"linux/arm64/v8".parse()?)?, arm);
        let err = select_platform(&data, &"linux/s390x".parse()?).unwrap_err();
        assert!(err.to_string().contains("linux/amd64"));
        Ok(())
    }
}
