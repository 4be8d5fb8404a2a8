//! Artifact kinds and their index sort group.

use std::fmt;
use std::str::FromStr;

use crate::descriptor::{
    is_index_media_type, MEDIA_TYPE_CHART_CONFIG, MEDIA_TYPE_CHART_LAYER, MEDIA_TYPE_DSSE,
    MEDIA_TYPE_FILE_CONFIG, MEDIA_TYPE_FILE_LAYER, MEDIA_TYPE_SIMPLE_SIGNING,
};
use crate::digest::Digest;
use crate::error::Error;

/// Prefix shared by cosign-ecosystem kinds.
pub const COSIGN_PREFIX: &str = "dev.cosignproject.cosign/";

/// Prefix of hauler-native kinds.
pub const HAULER_PREFIX: &str = "dev.hauler/";

/// What an index entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// A single-platform image.
    Image,
    /// A multi-platform image index.
    ImageIndex,
    /// A Helm chart.
    Chart,
    /// An arbitrary file.
    File,
    /// A collection marker.
    Collection,
    /// A cosign signature.
    Signature,
    /// An in-toto attestation.
    Attestation,
    /// A software bill of materials.
    Sbom,
}

impl Kind {
    /// Value of the `kind` annotation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Image => "dev.cosignproject.cosign/image",
            Kind::ImageIndex => "dev.cosignproject.cosign/imageIndex",
            Kind::Signature => "dev.cosignproject.cosign/sigs",
            Kind::Attestation => "dev.cosignproject.cosign/atts",
            Kind::Sbom => "dev.cosignproject.cosign/sboms",
            Kind::Chart => "dev.hauler/chart",
            Kind::File => "dev.hauler/file",
            Kind::Collection => "dev.hauler/collection",
        }
    }

    /// Short name used in log lines.
    pub fn short_name(&self) -> &'static str {
        match self {
            Kind::Image => "image",
            Kind::ImageIndex => "image-index",
            Kind::Chart => "chart",
            Kind::File => "file",
            Kind::Collection => "collection",
            Kind::Signature => "signature",
            Kind::Attestation => "attestation",
            Kind::Sbom => "sbom",
        }
    }

    /// Whether this kind describes another artifact.
    pub fn is_signature_family(&self) -> bool {
        matches!(self, Kind::Signature | Kind::Attestation | Kind::Sbom)
    }

    /// Cosign tag suffix used for signature-family artifacts.
    pub fn cosign_suffix(&self) -> Option<&'static str> {
        match self {
            Kind::Signature => Some("sig"),
            Kind::Attestation => Some("att"),
            Kind::Sbom => Some("sbom"),
            _ => None,
        }
    }

    /// Derive a kind from manifest and payload media types.
    pub fn from_media_types(
        manifest_media_type: &str,
        config_media_type: Option<&str>,
        layer_media_types: &[&str],
    ) -> Kind {
        if is_index_media_type(manifest_media_type) {
            return Kind::ImageIndex;
        }
        match config_media_type {
            Some(MEDIA_TYPE_CHART_CONFIG) => return Kind::Chart,
            Some(MEDIA_TYPE_FILE_CONFIG) => return Kind::File,
            _ => {}
        }
        if let Some(first) = layer_media_types.first() {
            match *first {
                MEDIA_TYPE_CHART_LAYER => return Kind::Chart,
                MEDIA_TYPE_FILE_LAYER => return Kind::File,
                MEDIA_TYPE_SIMPLE_SIGNING => return Kind::Signature,
                MEDIA_TYPE_DSSE => return Kind::Attestation,
                _ => {}
            }
        }
        Kind::Image
    }
}

/// Sort group of a raw `kind` annotation value: image-family first.
///
/// Unknown values sort with the image family unless they carry a
/// signature-family suffix under the cosign prefix.
pub fn sort_group(kind: &str) -> u8 {
    match kind.parse::<Kind>() {
        Ok(k) if k.is_signature_family() => 1,
        Ok(_) => 0,
        Err(_) => match kind.strip_prefix(COSIGN_PREFIX) {
            Some(rest) if ["sig", "att", "sbom"].iter().any(|p| rest.starts_with(p)) => 1,
            _ => 0,
        },
    }
}

/// The cosign tag (`sha256-<hex>.sig` and friends) for `kind` attached to `subject`.
pub fn cosign_tag(subject: &Digest, kind: Kind) -> Option<String> {
    kind.cosign_suffix()
        .map(|suffix| format!("{}-{}.{suffix}", subject.algorithm(), subject.hex()))
}

/// Inverse of [`cosign_tag`].
pub fn parse_cosign_tag(tag: &str) -> Option<(Digest, Kind)> {
    let (digest, suffix) = tag.rsplit_once('.')?;
    let kind = match suffix {
        "sig" => Kind::Signature,
        "att" => Kind::Attestation,
        "sbom" => Kind::Sbom,
        _ => return None,
    };
    let (algorithm, hex) = digest.split_once('-')?;
    let digest = Digest::new(algorithm.parse().ok()?, hex).ok()?;
    Some((digest, kind))
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Kind::Image,
            Kind::ImageIndex,
            Kind::Chart,
            Kind::File,
            Kind::Collection,
            Kind::Signature,
            Kind::Attestation,
            Kind::Sbom,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| Error::InvalidManifest(format!("unknown kind {s:?}")))
    }
}
