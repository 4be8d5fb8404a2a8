//! Collections: several artifacts that make up one thing.
//!
//! A k3s or rke2 release is its binary (k3s only), its install script, its
//! image list and every image on that list. A collection has no manifest of
//! its own; each item is stored as an ordinary artifact.

use std::fmt;

use anyhow::{Context, Result};
use tracing::info;
use url::Url;

use crate::download::fetch_bytes;
use crate::file::{self, FileSource};
use crate::image::{self, ImageSource};
use crate::{BuildContext, Built};

/// Where k3s release assets are published.
pub const K3S_RELEASES: &str = "https://github.com/k3s-io/k3s/releases/download";

/// Where k3s serves its install script.
pub const K3S_INSTALL: &str = "https://get.k3s.io";

/// Where rke2 release assets are published.
pub const RKE2_RELEASES: &str = "https://github.com/rancher/rke2/releases/download";

/// Where rke2 serves its install script.
pub const RKE2_INSTALL: &str = "https://get.rke2.io";

/// One release of a Kubernetes distribution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Distribution {
    /// Release tag, e.g. `v1.30.0+k3s1`.
    pub version: String,
    /// `amd64`, `arm64` or `arm`; `amd64` when empty.
    pub arch: String,
    /// Serve release assets from `<base>/<version>/` and the install
    /// script from `<base>/install.sh` instead of the upstream locations.
    pub base_url: Option<String>,
}

/// A bundle of artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection {
    /// k3s binary, install script, image list and images.
    K3s(Distribution),
    /// rke2 install script, image list and images.
    Rke2(Distribution),
    /// One image per non-comment line of a text file.
    ImageTxt {
        /// URL or path of the list.
        url: String,
    },
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::K3s(d) => write!(f, "k3s {}", d.version),
            Collection::Rke2(d) => write!(f, "rke2 {}", d.version),
            Collection::ImageTxt { url } => write!(f, "images from {url}"),
        }
    }
}

impl Distribution {
    fn arch(&self) -> &str {
        if self.arch.is_empty() {
            "amd64"
        } else {
            &self.arch
        }
    }

    /// URL of the release asset `asset`.
    fn asset(&self, releases: &str, asset: &str) -> String {
        let base = self.base_url.as_deref().unwrap_or(releases);
        let version = self.version.replace('+', "%2B");
        format!("{}/{version}/{asset}", base.trim_end_matches('/'))
    }

    /// URL of the install script.
    fn install_script(&self, upstream: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/install.sh", base.trim_end_matches('/')),
            None => upstream.to_string(),
        }
    }
}

/// The files a collection stores, without its images.
pub fn files(collection: &Collection) -> Vec<FileSource> {
    match collection {
        Collection::K3s(d) => {
            let binary = match d.arch() {
                "amd64" => "k3s".to_string(),
                "arm" => "k3s-armhf".to_string(),
                arch => format!("k3s-{arch}"),
            };
            vec![
                FileSource::new(d.asset(K3S_RELEASES, &binary))
                    .with_name(binary)
                    .with_tag(&d.version),
                FileSource::new(d.install_script(K3S_INSTALL))
                    .with_name("k3s-install.sh")
                    .with_tag(&d.version),
                FileSource::new(d.asset(K3S_RELEASES, "k3s-images.txt")).with_tag(&d.version),
            ]
        }
        Collection::Rke2(d) => {
            let images = format!("rke2-images-all.linux-{}.txt", d.arch());
            vec![
                FileSource::new(d.install_script(RKE2_INSTALL))
                    .with_name("rke2-install.sh")
                    .with_tag(&d.version),
                FileSource::new(d.asset(RKE2_RELEASES, &images)).with_tag(&d.version),
            ]
        }
        Collection::ImageTxt { .. } => Vec::new(),
    }
}

/// URL or path of the collection's image list.
fn image_list(collection: &Collection) -> String {
    match collection {
        Collection::K3s(d) => d.asset(K3S_RELEASES, "k3s-images.txt"),
        Collection::Rke2(d) => d.asset(RKE2_RELEASES, &format!("rke2-images-all.linux-{}.txt", d.arch())),
        Collection::ImageTxt { url } => url.clone(),
    }
}

/// Image references in an image list: one per line, `#` starts a comment.
pub fn parse_image_list(list: &str) -> Vec<String> {
    list.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

async fn read_list(ctx: &BuildContext, location: &str) -> Result<String> {
    let data = if location.starts_with("http://") || location.starts_with("https://") {
        let url = Url::parse(location).with_context(|| format!("Parsing URL {location}"))?;
        fetch_bytes(ctx, &url).await?.to_vec()
    } else {
        let path = location.strip_prefix("file://").unwrap_or(location);
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Reading {path}"))?
    };
    String::from_utf8(data).with_context(|| format!("{location} is not UTF-8"))
}

/// Build every item of `collection`.
pub async fn build(ctx: &BuildContext, collection: &Collection) -> Result<Vec<Built>> {
    let mut built = Vec::new();
    for source in files(collection) {
        built.push(file::build(ctx, &source).await?);
    }
    let images = parse_image_list(&read_list(ctx, &image_list(collection)).await?);
    info!("{collection}: {} files, {} images", built.len(), images.len());
    for name in images {
        built.extend(image::build(ctx, &ImageSource::new(name)).await?);
    }
    Ok(built)
}
