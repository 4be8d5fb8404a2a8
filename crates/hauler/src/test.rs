//! Test utilities for the content store.
//!
//! Temporary directories, a throwaway [`Store`], and small artifacts to
//! feed it.

use std::ffi::OsString;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use tempfile::TempDir;

use crate::artifact::{Artifact, Layer};
use crate::config::StoreConfig;
use crate::descriptor::{
    Descriptor, Manifest, ANNOTATION_TITLE, MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_FILE_CONFIG, MEDIA_TYPE_FILE_LAYER, MEDIA_TYPE_OCI_CONFIG,
};
use crate::store::Store;

/// Media type of the layers in [`sample_image`].
pub const SAMPLE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

static TMPDIR: LazyLock<OsString> = LazyLock::new(|| {
    if let Some(path) = std::env::var_os("HAULER_TEST_TMPDIR") {
        eprintln!("temporary directory from $HAULER_TEST_TMPDIR: {path:?}");
        path
    } else {
        std::env::temp_dir().into_os_string()
    }
});

/// Allocate a temporary directory.
pub fn tempdir() -> TempDir {
    TempDir::with_prefix_in("hauler-test-", TMPDIR.as_os_str()).unwrap()
}

/// A store in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TestStore {
    /// The store, shareable with a server under test.
    pub store: Arc<Store>,
    _tempdir: TempDir,
}

impl TestStore {
    /// Open an empty store. Staging happens inside the same directory.
    pub async fn new() -> Self {
        let dir = tempdir();
        let config = StoreConfig::new(dir.path().join("store")).with_tmp_dir(dir.path().join("tmp"));
        let store = Store::open(&config).await.unwrap();
        TestStore {
            store: Arc::new(store),
            _tempdir: dir,
        }
    }

    /// Root of the layout.
    pub fn root(&self) -> &Path {
        self.store.root()
    }
}

/// A one-layer OCI image whose bytes depend on `seed`.
pub fn sample_image(seed: u8) -> Artifact {
    let config = Bytes::from(format!(
        r#"{{"architecture":"amd64","os":"linux","rootfs":{{"type":"layers","diff_ids":[]}},"seed":{seed}}}"#
    ));
    let layer = Layer::from_bytes(SAMPLE_LAYER_MEDIA_TYPE, format!("layer bytes {seed}").into_bytes());
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, &config),
        vec![layer.descriptor.clone()],
    );
    Artifact::from_manifest(&manifest, config, vec![layer]).unwrap()
}

/// [`sample_image`] in the Docker schema 2 format.
pub fn sample_docker_image(seed: u8) -> Artifact {
    let config = Bytes::from(format!(
        r#"{{"architecture":"amd64","os":"linux","rootfs":{{"type":"layers","diff_ids":[]}},"seed":{seed}}}"#
    ));
    let layer = Layer::from_bytes(
        "application/vnd.docker.image.rootfs.diff.tar.gzip",
        format!("docker layer bytes {seed}").into_bytes(),
    );
    let mut manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_DOCKER_CONFIG, &config),
        vec![layer.descriptor.clone()],
    );
    manifest.media_type = Some(MEDIA_TYPE_DOCKER_MANIFEST.to_string());
    Artifact::from_manifest(&manifest, config, vec![layer]).unwrap()
}

/// A file artifact titled `name`.
pub fn sample_file(name: &str, contents: &[u8]) -> Artifact {
    let config = Bytes::from(serde_json::json!({ "name": name }).to_string());
    let layer = Layer::from_bytes(MEDIA_TYPE_FILE_LAYER, contents.to_vec())
        .with_annotation(ANNOTATION_TITLE, name);
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_FILE_CONFIG, &config),
        vec![layer.descriptor.clone()],
    );
    Artifact::from_manifest(&manifest, config, vec![layer]).unwrap()
}
