//! Client and copy flows against a live server on a loopback port.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hauler::descriptor::MEDIA_TYPE_OCI_CONFIG;
use hauler::test::{sample_docker_image, sample_file, TestStore, SAMPLE_LAYER_MEDIA_TYPE};
use hauler::{Artifact, BlobReader, Descriptor, Digest, Layer, Manifest, Reference, Store, Target};
use hauler_registry::{serve_on, ClientConfig, RegistryClient, RegistryTarget, ServeConfig};

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    async fn start(store: Arc<Store>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let config = ServeConfig {
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve_on(store, listener, &config, shutdown).await }
        });
        Server {
            addr,
            shutdown,
            handle,
        }
    }

    fn host(&self) -> String {
        self.addr.to_string()
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}

#[tokio::test]
async fn test_copy_to_registry_rewrites_host() -> anyhow::Result<()> {
    let source = TestStore::new().await;
    let image = source
        .store
        .add(&sample_docker_image(7), &"library/busybox:1.34.1".parse()?)
        .await?;
    source
        .store
        .add(&sample_file("k3s", b"#!/bin/sh\n"), &"hauler/k3s:v1.30.0".parse()?)
        .await?;

    let dest = TestStore::new().await;
    let server = Server::start(dest.store.clone()).await;
    let client = RegistryClient::new(ClientConfig::default())?;
    let target = RegistryTarget::new(client.clone(), server.host());

    let report = source.store.copy(&target).await?;
    assert_eq!(report.manifests, 2);
    assert_eq!(report.blobs_copied, 4);

    let pushed = dest.store.resolve_manifest("library/busybox", "1.34.1").await?;
    assert_eq!(pushed.digest, image.digest);
    assert_eq!(pushed.media_type, image.media_type);

    let remote: Reference = format!("{}/library/busybox:1.34.1", server.host()).parse()?;
    let manifest = client.resolve_manifest(&remote).await?;
    assert_eq!(manifest.digest, image.digest);
    assert_eq!(
        manifest.data,
        source.store.read_blob(&image.digest).await?
    );

    let again = source.store.copy(&target).await?;
    assert_eq!(again.blobs_copied, 0);
    assert_eq!(again.blobs_skipped, 4);

    server.stop().await
}

#[tokio::test]
async fn test_client_pull() -> anyhow::Result<()> {
    let store = TestStore::new().await;
    let artifact = sample_docker_image(8);
    store
        .store
        .add(&artifact, &"library/alpine:3.20".parse()?)
        .await?;
    let server = Server::start(store.store.clone()).await;
    let client = RegistryClient::new(ClientConfig::default())?;

    let reference: Reference = format!("{}/library/alpine:3.20", server.host()).parse()?;
    let manifest = client.resolve_manifest(&reference).await?;
    let layer = &artifact.layers[0].descriptor;
    assert!(client.blob_exists(&reference, &layer.digest).await?);
    let data = client.fetch_blob_bytes(&reference, &layer.digest).await?;
    assert_eq!(data, "docker layer bytes 8");

    let pinned = reference.with_digest(manifest.digest.clone());
    assert_eq!(client.resolve_manifest(&pinned).await?.digest, manifest.digest);

    let missing = reference.with_tag("3.21")?;
    let err = client.resolve_manifest(&missing).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<hauler::Error>(),
        Some(hauler::Error::ReferenceNotFound(_))
    ));

    server.stop().await
}

/// Records which repositories received which blobs, like a registry that
/// keeps blobs per repository.
#[derive(Debug, Default)]
struct RecordingTarget {
    blobs: Mutex<BTreeMap<Digest, Vec<String>>>,
    manifests: Mutex<Vec<String>>,
}

#[async_trait]
impl Target for RecordingTarget {
    async fn blob_exists(&self, reference: &Reference, descriptor: &Descriptor) -> hauler::Result<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .get(&descriptor.digest)
            .is_some_and(|repos| repos.contains(&reference.name())))
    }

    async fn put_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        _reader: BlobReader,
    ) -> hauler::Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs
            .entry(descriptor.digest.clone())
            .or_default()
            .push(reference.name());
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        _manifest: &[u8],
        _media_type: &str,
    ) -> hauler::Result<()> {
        self.manifests.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

fn image_with_base(base: &Layer, name: &str) -> Artifact {
    let config = Bytes::from(format!(r#"{{"architecture":"amd64","os":"linux","name":"{name}"}}"#));
    let top = Layer::from_bytes(SAMPLE_LAYER_MEDIA_TYPE, format!("{name} layer").into_bytes());
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, &config),
        vec![base.descriptor.clone(), top.descriptor.clone()],
    );
    Artifact::from_manifest(&manifest, config, vec![base.clone(), top]).unwrap()
}

#[tokio::test]
async fn test_copy_shared_layer_to_each_repository() -> anyhow::Result<()> {
    let source = TestStore::new().await;
    let base = Layer::from_bytes(SAMPLE_LAYER_MEDIA_TYPE, b"shared base layer".to_vec());
    source
        .store
        .add(&image_with_base(&base, "alpine"), &"library/alpine:1".parse()?)
        .await?;
    source
        .store
        .add(&image_with_base(&base, "busybox"), &"library/busybox:1".parse()?)
        .await?;

    let target = RecordingTarget::default();
    let report = source.store.copy(&target).await?;
    assert_eq!(report.manifests, 2);
    // two configs, two top layers and the base once per repository
    assert_eq!(report.blobs_copied, 6);

    let blobs = target.blobs.lock().unwrap();
    assert_eq!(
        blobs[&base.descriptor.digest],
        vec!["library/alpine".to_string(), "library/busybox".to_string()]
    );
    drop(blobs);

    let again = source.store.copy(&target).await?;
    assert_eq!(again.blobs_copied, 0);
    assert_eq!(again.blobs_skipped, 6);
    Ok(())
}
