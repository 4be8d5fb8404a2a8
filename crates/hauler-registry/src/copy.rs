//! Copying a store into a remote registry.

use async_trait::async_trait;

use hauler::{BlobReader, Descriptor, Reference, Target};

use crate::client::RegistryClient;

/// Pushes store content to `host`, replacing each reference's registry.
///
/// `library/busybox:1.34.1` copied to `example.com:5000` is pushed as
/// `example.com:5000/library/busybox:1.34.1` with unchanged digests.
#[derive(Debug, Clone)]
pub struct RegistryTarget {
    client: RegistryClient,
    host: String,
}

impl RegistryTarget {
    /// Target the registry at `host` (`name[:port]`).
    pub fn new(client: RegistryClient, host: impl Into<String>) -> Self {
        RegistryTarget {
            client,
            host: host.into(),
        }
    }

    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Keep store errors as they are; everything else is a remote failure.
fn remote_error(reference: &Reference, err: anyhow::Error) -> hauler::Error {
    match err.downcast::<hauler::Error>() {
        Ok(err) => err,
        Err(err) => hauler::Error::SourceUnavailable {
            origin: reference.to_string(),
            cause: err.into(),
        },
    }
}

#[async_trait]
impl Target for RegistryTarget {
    fn rewrite(&self, reference: &Reference) -> hauler::Result<Reference> {
        reference.with_registry(&self.host)
    }

    async fn blob_exists(&self, reference: &Reference, descriptor: &Descriptor) -> hauler::Result<bool> {
        self.client
            .blob_exists(reference, &descriptor.digest)
            .await
            .map_err(|e| remote_error(reference, e))
    }

    async fn put_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        reader: BlobReader,
    ) -> hauler::Result<()> {
        self.client
            .upload_blob(reference, &descriptor.digest, descriptor.size, reader)
            .await
            .map_err(|e| remote_error(reference, e))
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        manifest: &[u8],
        media_type: &str,
    ) -> hauler::Result<()> {
        self.client
            .put_manifest(reference, manifest, media_type)
            .await
            .map_err(|e| remote_error(reference, e))?;
        tracing::info!("pushed {reference}");
        Ok(())
    }
}
