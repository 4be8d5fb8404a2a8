//! Builders against a loopback registry and a mock HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use mockito::Matcher;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hauler::descriptor::{ImageIndex, Platform, MEDIA_TYPE_OCI_INDEX};
use hauler::test::{sample_docker_image, sample_image, tempdir, TestStore};
use hauler::{Descriptor, Digest, Kind, Store};
use hauler_content::collection::{self, Collection, Distribution};
use hauler_content::signature::{self, Signer, Verifier};
use hauler_content::{
    add, chart, file, image, BuildContext, ChartSource, FileSource, ImageSource, Source, Templater,
};
use hauler_registry::{serve_on, ClientConfig, RegistryClient, RetryPolicy, ServeConfig};

struct Registry {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Registry {
    async fn start(store: Arc<Store>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let config = ServeConfig {
            read_only: true,
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve_on(store, listener, &config, shutdown).await }
        });
        Registry {
            addr,
            shutdown,
            handle,
        }
    }

    fn image(&self, path: &str) -> String {
        format!("{}/{path}", self.addr)
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}

/// An upstream store holding `library/busybox:1.34.1` and the two-platform
/// index `library/multi:v1`.
struct Upstream {
    test: TestStore,
    busybox: Descriptor,
    amd64: Descriptor,
    arm64: Descriptor,
    index: Digest,
}

impl Upstream {
    async fn new() -> Result<Self> {
        let test = TestStore::new().await;
        let store = &test.store;
        let busybox = store
            .add(&sample_docker_image(8), &"library/busybox:1.34.1".parse()?)
            .await?;
        let amd64 = store
            .add(&sample_image(1), &"library/multi:amd64".parse()?)
            .await?;
        let arm64 = store
            .add(&sample_image(2), &"library/multi:arm64".parse()?)
            .await?;

        let child = |d: &Descriptor, arch: &str| {
            let mut child = Descriptor::new(d.media_type.clone(), d.digest.clone(), d.size);
            child.platform = Some(Platform {
                architecture: arch.to_string(),
                os: "linux".to_string(),
                variant: None,
                os_version: None,
            });
            child
        };
        let mut document = ImageIndex::empty();
        document.manifests = vec![child(&amd64, "amd64"), child(&arm64, "arm64")];
        let data = serde_json::to_vec(&document)?;
        let index = store
            .put_manifest("library/multi", "v1", &data, Some(MEDIA_TYPE_OCI_INDEX))
            .await?
            .digest;
        Ok(Upstream {
            test,
            busybox,
            amd64,
            arm64,
            index,
        })
    }

    fn store(&self) -> &Store {
        &self.test.store
    }
}

fn context(dir: &std::path::Path) -> Result<BuildContext> {
    let client = RegistryClient::new(ClientConfig::default())?;
    Ok(BuildContext::new(client, dir)?.with_retry(RetryPolicy::fast()))
}

/// Signs with the hex sha256 of the payload.
#[derive(Debug)]
struct HashSigner;

#[async_trait]
impl Signer for HashSigner {
    async fn sign(&self, payload: &[u8]) -> Result<String> {
        Ok(Digest::sha256(payload).hex().to_string())
    }
}

#[async_trait]
impl Verifier for HashSigner {
    async fn verify(&self, payload: &[u8], signature: &str) -> Result<()> {
        ensure!(Digest::sha256(payload).hex() == signature, "bad signature");
        Ok(())
    }
}

/// Renders every chart to the same manifests.
#[derive(Debug)]
struct FixedTemplater(String);

#[async_trait]
impl Templater for FixedTemplater {
    async fn template(&self, _release: &str, _chart: &std::path::Path) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug)]
struct BrokenTemplater;

#[async_trait]
impl Templater for BrokenTemplater {
    async fn template(&self, _release: &str, _chart: &std::path::Path) -> Result<String> {
        anyhow::bail!("helm: not installed")
    }
}

fn package(name: &str, version: &str) -> Vec<u8> {
    let chart_yaml = format!("apiVersion: v2\nname: {name}\nversion: {version}\n");
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(chart_yaml.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{name}/Chart.yaml"), chart_yaml.as_bytes())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn test_image_index_whole_or_by_platform() -> Result<()> {
    let upstream = Upstream::new().await?;
    let registry = Registry::start(upstream.test.store.clone()).await;
    let dir = tempdir();
    let ctx = context(dir.path())?;
    let name = registry.image("library/multi:v1");
    let cancel = CancellationToken::new();

    let dest = TestStore::new().await;
    let added = add(&dest.store, &ctx, &Source::Image(ImageSource::new(&name)), &cancel).await?;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].digest, upstream.index);
    assert_eq!(added[0].kind_annotation(), Some(Kind::ImageIndex.as_str()));
    for child in [&upstream.amd64, &upstream.arm64] {
        let found = dest
            .store
            .resolve_manifest(&registry.image("library/multi"), &child.digest.to_string())
            .await?;
        assert_eq!(found.digest, child.digest);
    }
    assert!(dest.store.fsck().await?.is_ok());

    let source = ImageSource {
        name: name.clone(),
        platform: Some("linux/arm64".into()),
        signatures: false,
    };
    let built = image::build(&ctx, &source).await?;
    assert_eq!(built.len(), 1);
    assert_eq!(built[0].reference.to_string(), name);
    assert_eq!(built[0].artifact.digest(), upstream.arm64.digest);
    assert_eq!(built[0].artifact.kind(), Kind::Image);

    let source = ImageSource {
        platform: Some("linux/s390x".into()),
        ..source
    };
    let err = image::build(&ctx, &source).await.unwrap_err();
    assert!(format!("{err:#}").contains("linux/arm64"), "{err:#}");

    registry.stop().await
}

#[tokio::test]
async fn test_image_with_signatures() -> Result<()> {
    let upstream = Upstream::new().await?;
    signature::sign(upstream.store(), "library/busybox:1.34.1", &HashSigner).await?;
    let registry = Registry::start(upstream.test.store.clone()).await;
    let dir = tempdir();
    let ctx = context(dir.path())?;
    let name = registry.image("library/busybox:1.34.1");

    let source = ImageSource {
        name: name.clone(),
        platform: None,
        signatures: true,
    };
    let built = image::build(&ctx, &source).await?;
    assert_eq!(built.len(), 2, "only the signature is published");
    assert_eq!(built[0].artifact.digest(), upstream.busybox.digest);
    assert_eq!(built[1].artifact.kind(), Kind::Signature);
    assert_eq!(
        built[1].reference.to_string(),
        registry.image(&format!("library/busybox:sha256-{}.sig", upstream.busybox.digest.hex()))
    );

    let dest = TestStore::new().await;
    add(&dest.store, &ctx, &Source::Image(source), &CancellationToken::new()).await?;
    assert_eq!(signature::verify(&dest.store, &name, &HashSigner).await?, 1);
    let referrers = signature::referrers(&dest.store, &upstream.busybox.digest).await?;
    assert_eq!(referrers.len(), 1);

    registry.stop().await
}

#[tokio::test]
async fn test_missing_image() -> Result<()> {
    let upstream = Upstream::new().await?;
    let registry = Registry::start(upstream.test.store.clone()).await;
    let dir = tempdir();
    let ctx = context(dir.path())?;

    let err = image::build(&ctx, &ImageSource::new(registry.image("library/busybox:9.9")))
        .await
        .unwrap_err();
    let store_err = err.downcast_ref::<hauler::Error>();
    assert!(store_err.is_some_and(|e| e.is_not_found()), "{err:#}");

    registry.stop().await
}

#[tokio::test]
async fn test_chart_from_repository_with_images() -> Result<()> {
    let upstream = Upstream::new().await?;
    let registry = Registry::start(upstream.test.store.clone()).await;

    let mut server = mockito::Server::new_async().await;
    let index = "apiVersion: v1\nentries:\n  demo:\n    - version: 0.2.0-rc.1\n      urls: [charts/demo-0.2.0-rc.1.tgz]\n    - version: 0.1.0\n      urls: [charts/demo-0.1.0.tgz]\n";
    let _index = server
        .mock("GET", "/index.yaml")
        .with_status(200)
        .with_body(index)
        .create_async()
        .await;
    let tgz = package("demo", "0.1.0");
    let _chart = server
        .mock("GET", "/charts/demo-0.1.0.tgz")
        .with_status(200)
        .with_body(&tgz)
        .create_async()
        .await;

    let rendered = format!(
        "apiVersion: apps/v1\nkind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: app\n          image: {}\n",
        registry.image("library/busybox:1.34.1")
    );
    let dir = tempdir();
    let ctx = context(dir.path())?.with_templater(Arc::new(FixedTemplater(rendered)));
    let source = ChartSource {
        name: "demo".into(),
        repo: Some(server.url()),
        version: None,
        add_images: true,
    };

    let built = chart::build(&ctx, &source).await?;
    let references: Vec<String> = built.iter().map(|b| b.reference.to_string()).collect();
    assert_eq!(
        references,
        vec![
            "hauler/demo:0.1.0".to_string(),
            registry.image("library/busybox:1.34.1"),
        ]
    );
    assert_eq!(built[0].artifact.kind(), Kind::Chart);
    assert_eq!(built[0].artifact.layers[0].descriptor.size, tgz.len() as u64);
    assert_eq!(built[1].artifact.digest(), upstream.busybox.digest);

    // A chart that cannot be rendered is still stored.
    let ctx = ctx.with_templater(Arc::new(BrokenTemplater));
    let built = chart::build(&ctx, &source).await?;
    assert_eq!(built.len(), 1);

    let missing = ChartSource {
        version: Some("3.0.0".into()),
        ..source
    };
    let err = chart::build(&ctx, &missing).await.unwrap_err();
    assert!(
        err.downcast_ref::<hauler::Error>().is_some_and(|e| e.is_not_found()),
        "{err:#}"
    );

    registry.stop().await
}

#[tokio::test]
async fn test_remote_file() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _download = server
        .mock("GET", "/releases/latest")
        .with_status(200)
        .with_header("content-disposition", "attachment; filename=\"k3s-arm64\"")
        .with_body("ELF pretend binary")
        .create_async()
        .await;
    let _missing = server
        .mock("GET", "/releases/gone")
        .with_status(404)
        .create_async()
        .await;

    let dir = tempdir();
    let ctx = context(dir.path())?;
    let source = FileSource::new(format!("{}/releases/latest", server.url())).with_tag("v1.30.0+k3s1");
    let dest = TestStore::new().await;
    let added = add(&dest.store, &ctx, &Source::File(source), &CancellationToken::new()).await?;
    assert_eq!(added[0].ref_name(), Some("hauler/k3s-arm64:v1.30.0-k3s1"));
    assert_eq!(added[0].kind_annotation(), Some(Kind::File.as_str()));

    let out = tempdir();
    let written = dest
        .store
        .extract("hauler/k3s-arm64:v1.30.0-k3s1", out.path())
        .await?;
    assert_eq!(written, vec![out.path().join("k3s-arm64")]);
    assert_eq!(std::fs::read(&written[0])?, b"ELF pretend binary");

    let gone = FileSource::new(format!("{}/releases/gone", server.url()));
    let err = file::build(&ctx, &gone).await.unwrap_err();
    assert!(
        err.downcast_ref::<hauler::Error>().is_some_and(|e| e.is_not_found()),
        "{err:#}"
    );
    Ok(())
}

#[tokio::test]
async fn test_k3s_collection() -> Result<()> {
    let upstream = Upstream::new().await?;
    let registry = Registry::start(upstream.test.store.clone()).await;

    let mut server = mockito::Server::new_async().await;
    let _binary = server
        .mock("GET", Matcher::Regex(r"^/v1\.30\.0.*k3s1/k3s$".into()))
        .with_status(200)
        .with_body("k3s binary")
        .create_async()
        .await;
    let _images = server
        .mock("GET", Matcher::Regex(r"^/v1\.30\.0.*k3s1/k3s-images\.txt$".into()))
        .with_status(200)
        .with_body(format!(
            "# bundled\n{}\n",
            registry.image("library/busybox:1.34.1")
        ))
        .create_async()
        .await;
    let _install = server
        .mock("GET", "/install.sh")
        .with_status(200)
        .with_body("#!/bin/sh\n")
        .create_async()
        .await;

    let dir = tempdir();
    let ctx = context(dir.path())?;
    let collection = Collection::K3s(Distribution {
        version: "v1.30.0+k3s1".into(),
        arch: String::new(),
        base_url: Some(server.url()),
    });
    let dest = TestStore::new().await;
    let added = add(
        &dest.store,
        &ctx,
        &Source::Collection(collection),
        &CancellationToken::new(),
    )
    .await?;
    let mut references: Vec<String> = added
        .iter()
        .filter_map(|d| d.ref_name().map(str::to_string))
        .collect();
    references.sort();
    let mut expected = vec![
        "hauler/k3s-images.txt:v1.30.0-k3s1".to_string(),
        "hauler/k3s-install.sh:v1.30.0-k3s1".to_string(),
        "hauler/k3s:v1.30.0-k3s1".to_string(),
        registry.image("library/busybox:1.34.1"),
    ];
    expected.sort();
    assert_eq!(references, expected);
    assert!(dest.store.fsck().await?.is_ok());

    registry.stop().await
}

#[tokio::test]
async fn test_image_list_collection() -> Result<()> {
    let upstream = Upstream::new().await?;
    let registry = Registry::start(upstream.test.store.clone()).await;
    let dir = tempdir();
    let list = dir.path().join("images.txt");
    std::fs::write(
        &list,
        format!(
            "# airgap images\n{}\n\n{}\n",
            registry.image("library/busybox:1.34.1"),
            registry.image("library/multi:amd64")
        ),
    )?;

    let ctx = context(dir.path())?;
    let built = collection::build(
        &ctx,
        &Collection::ImageTxt {
            url: list.to_string_lossy().into_owned(),
        },
    )
    .await?;
    let digests: Vec<Digest> = built.iter().map(|b| b.artifact.digest()).collect();
    assert_eq!(digests, vec![upstream.busybox.digest.clone(), upstream.amd64.digest.clone()]);

    registry.stop().await
}
