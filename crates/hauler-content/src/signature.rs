//! Cosign-style signatures, attestations and SBOMs.
//!
//! Companions are ordinary artifacts stored next to their subject under the
//! cosign tag convention (`<repo>:sha256-<hex>.sig` and friends), with a
//! `dev.hauler/subject` annotation naming the subject digest. The store
//! sorts them after image-family entries, so a walk meets every subject
//! before its signatures.
//!
//! The cryptography lives behind [`Signer`] and [`Verifier`]; [`CosignCli`]
//! shells out to `cosign` for both.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use hauler::artifact::BytesOpener;
use hauler::descriptor::{
    ANNOTATION_SUBJECT, MEDIA_TYPE_DSSE, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_SIMPLE_SIGNING,
};
use hauler::kind::cosign_tag;
use hauler::{Artifact, Descriptor, Digest, Kind, Layer, Manifest, ManifestDocument, Reference, Store};

/// Layer annotation carrying the base64 signature.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

const SIGNATURE_TYPE: &str = "cosign container image signature";

/// Config blob of every companion manifest.
const COMPANION_CONFIG: &[u8] =
    br#"{"architecture":"","os":"","config":{},"rootfs":{"type":"layers","diff_ids":[]}}"#;

/// Produces a detached signature over a payload.
#[async_trait]
pub trait Signer: Send + Sync + Debug {
    /// Sign `payload`, returning the signature as base64.
    async fn sign(&self, payload: &[u8]) -> Result<String>;
}

/// Checks a detached signature.
#[async_trait]
pub trait Verifier: Send + Sync + Debug {
    /// Fail unless `signature` (base64) is valid for `payload`.
    async fn verify(&self, payload: &[u8], signature: &str) -> Result<()>;
}

/// The `cosign` binary with a key pair.
///
/// Signing needs the private key, verification the public one. The key
/// password is passed through `COSIGN_PASSWORD`.
#[derive(Debug, Clone)]
pub struct CosignCli {
    /// Path to `cosign`.
    pub binary: PathBuf,
    /// Key file.
    pub key: PathBuf,
    /// Password of a private key.
    pub password: Option<String>,
}

impl CosignCli {
    /// `cosign` from `$PATH` with `key`.
    pub fn new(key: impl Into<PathBuf>) -> Self {
        CosignCli {
            binary: PathBuf::from("cosign"),
            key: key.into(),
            password: None,
        }
    }

    /// Unlock the private key with `password`.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(subcommand)
            .arg("--key")
            .arg(&self.key)
            .env("COSIGN_PASSWORD", self.password.as_deref().unwrap_or_default())
            .kill_on_drop(true);
        cmd
    }
}

async fn run(mut cmd: Command, what: &str) -> Result<Vec<u8>> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("Running {what}"))?;
    if !output.status.success() {
        bail!(
            "{what} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

#[async_trait]
impl Signer for CosignCli {
    async fn sign(&self, payload: &[u8]) -> Result<String> {
        let file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(file.path(), payload).await?;
        let mut cmd = self.command("sign-blob");
        cmd.args(["--yes", "--tlog-upload=false"]).arg(file.path());
        let stdout = run(cmd, "cosign sign-blob").await?;
        let signature = String::from_utf8(stdout)?.trim().to_string();
        STANDARD
            .decode(&signature)
            .context("cosign sign-blob printed something other than base64")?;
        Ok(signature)
    }
}

#[async_trait]
impl Verifier for CosignCli {
    async fn verify(&self, payload: &[u8], signature: &str) -> Result<()> {
        let payload_file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(payload_file.path(), payload).await?;
        let signature_file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(signature_file.path(), signature).await?;
        let mut cmd = self.command("verify-blob");
        cmd.arg("--signature")
            .arg(signature_file.path())
            .arg("--insecure-ignore-tlog=true")
            .arg(payload_file.path());
        run(cmd, "cosign verify-blob").await?;
        Ok(())
    }
}

/// The simple-signing payload cosign signs for a container image.
#[derive(Debug, Serialize, Deserialize)]
struct SimpleSigning {
    critical: Critical,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    optional: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Critical {
    identity: Identity,
    image: SignedImage,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Identity {
    #[serde(rename = "docker-reference")]
    docker_reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedImage {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

impl SimpleSigning {
    fn new(name: String, digest: &Digest) -> Self {
        SimpleSigning {
            critical: Critical {
                identity: Identity {
                    docker_reference: name,
                },
                image: SignedImage {
                    docker_manifest_digest: digest.to_string(),
                },
                kind: SIGNATURE_TYPE.to_string(),
            },
            optional: None,
        }
    }
}

/// An attestation or SBOM to attach.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// [`Kind::Attestation`] or [`Kind::Sbom`].
    pub kind: Kind,
    /// Media type of the payload layer.
    pub media_type: String,
    /// The payload.
    pub data: Bytes,
}

impl Attachment {
    /// A DSSE-enveloped in-toto attestation.
    pub fn attestation(envelope: impl Into<Bytes>) -> Self {
        Attachment {
            kind: Kind::Attestation,
            media_type: MEDIA_TYPE_DSSE.to_string(),
            data: envelope.into(),
        }
    }

    /// An SBOM document of type `media_type`, e.g. `application/spdx+json`.
    pub fn sbom(media_type: impl Into<String>, document: impl Into<Bytes>) -> Self {
        Attachment {
            kind: Kind::Sbom,
            media_type: media_type.into(),
            data: document.into(),
        }
    }
}

/// The stored subject and the reference it is indexed under.
async fn subject(store: &Store, reference: &str) -> Result<(Descriptor, Reference)> {
    let descriptor = store.resolve(reference).await?;
    let name = descriptor
        .ref_name()
        .ok_or_else(|| anyhow!("{reference} has no reference annotation"))?;
    let parsed: Reference = name.parse()?;
    Ok((descriptor, parsed))
}

/// Where companions of `kind` for `subject` are stored.
fn companion_reference(subject: &Descriptor, name: &Reference, kind: Kind) -> Result<Reference> {
    let tag = cosign_tag(&subject.digest, kind)
        .ok_or_else(|| anyhow!("{} artifacts cannot be attached", kind.short_name()))?;
    Ok(Reference::new(
        name.registry(),
        name.repository(),
        Some(&tag),
        None,
    )?)
}

async fn read_manifest(store: &Store, descriptor: &Descriptor) -> Result<Manifest> {
    let data = store.read_blob(&descriptor.digest).await?;
    match ManifestDocument::parse(&data, Some(&descriptor.media_type))? {
        ManifestDocument::Manifest(manifest) => Ok(manifest),
        ManifestDocument::Index(_) => bail!("{} is an index, not a manifest", descriptor.digest),
    }
}

/// The newest manifest stored at `reference`, if any.
async fn existing(store: &Store, reference: &Reference) -> Result<Option<Manifest>> {
    match store.resolve(&reference.to_string()).await {
        Ok(descriptor) => Ok(Some(read_manifest(store, &descriptor).await?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Store `layer` in the companion manifest of `kind` for `reference`.
///
/// Layers already in the companion are kept, so repeated signing with
/// different keys accumulates signatures.
async fn store_companion(store: &Store, reference: &str, kind: Kind, layer: Layer) -> Result<Descriptor> {
    let (subject, name) = subject(store, reference).await?;
    let target = companion_reference(&subject, &name, kind)?;

    let mut layers = Vec::new();
    if let Some(manifest) = existing(store, &target).await? {
        for descriptor in manifest.layers {
            let data = store.read_blob(&descriptor.digest).await?;
            layers.push(Layer::new(descriptor, BytesOpener::new(data)));
        }
    }
    if layers.iter().any(|l| l.descriptor == layer.descriptor) {
        debug!("{target} already holds {}", layer.descriptor.digest);
    } else {
        layers.push(layer);
    }

    let config = Bytes::from_static(COMPANION_CONFIG);
    let manifest = Manifest::new(
        Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, &config),
        layers.iter().map(|l| l.descriptor.clone()).collect(),
    );
    let artifact = Artifact::from_manifest(&manifest, config, layers)?
        .with_kind(kind)
        .with_annotation(ANNOTATION_SUBJECT, subject.digest.to_string());
    Ok(store.add(&artifact, &target).await?)
}

/// Sign the artifact stored at `reference`.
pub async fn sign(store: &Store, reference: &str, signer: &dyn Signer) -> Result<Descriptor> {
    let (subject, name) = subject(store, reference).await?;
    let payload = serde_json::to_vec(&SimpleSigning::new(name.name(), &subject.digest))?;
    let signature = signer
        .sign(&payload)
        .await
        .with_context(|| format!("Signing {reference}"))?;
    let layer = Layer::from_bytes(MEDIA_TYPE_SIMPLE_SIGNING, payload)
        .with_annotation(SIGNATURE_ANNOTATION, signature);
    let descriptor = store_companion(store, reference, Kind::Signature, layer).await?;
    info!("signed {reference} ({})", subject.digest);
    Ok(descriptor)
}

/// Attach an attestation or SBOM to the artifact stored at `reference`.
pub async fn attach(store: &Store, reference: &str, attachment: Attachment) -> Result<Descriptor> {
    ensure!(
        matches!(attachment.kind, Kind::Attestation | Kind::Sbom),
        "cannot attach a {}",
        attachment.kind.short_name()
    );
    let layer = Layer::from_bytes(attachment.media_type, attachment.data);
    store_companion(store, reference, attachment.kind, layer).await
}

/// Verify every signature of the artifact stored at `reference`.
///
/// Returns how many signatures were checked; an unsigned artifact is an
/// error.
pub async fn verify(store: &Store, reference: &str, verifier: &dyn Verifier) -> Result<usize> {
    let (subject, name) = subject(store, reference).await?;
    let target = companion_reference(&subject, &name, Kind::Signature)?;
    let manifest = existing(store, &target)
        .await?
        .ok_or_else(|| anyhow!("{reference} has no signatures"))?;

    let expected = subject.digest.to_string();
    let mut verified = 0;
    for layer in manifest
        .layers
        .iter()
        .filter(|l| l.media_type == MEDIA_TYPE_SIMPLE_SIGNING)
    {
        let signature = layer
            .annotation(SIGNATURE_ANNOTATION)
            .ok_or_else(|| anyhow!("signature layer {} has no signature", layer.digest))?;
        let payload = store.read_blob(&layer.digest).await?;
        let claim: SimpleSigning = serde_json::from_slice(&payload)
            .with_context(|| format!("Parsing signature payload {}", layer.digest))?;
        let claimed = &claim.critical.image.docker_manifest_digest;
        ensure!(
            *claimed == expected,
            "signature {} is for {claimed}, not {expected}",
            layer.digest
        );
        verifier
            .verify(&payload, signature)
            .await
            .with_context(|| format!("Verifying signature {}", layer.digest))?;
        verified += 1;
    }
    ensure!(verified > 0, "{reference} has no signatures");
    info!("verified {verified} signatures for {reference}");
    Ok(verified)
}

/// Companions whose subject is `digest`, newest per reference.
pub async fn referrers(store: &Store, digest: &Digest) -> Result<Vec<Descriptor>> {
    let subject = digest.to_string();
    let mut found = Vec::new();
    for descriptor in store.list().await {
        if descriptor.annotation(ANNOTATION_SUBJECT) != Some(subject.as_str()) {
            continue;
        }
        let Some(name) = descriptor.ref_name() else {
            continue;
        };
        if store.resolve(name).await?.digest == descriptor.digest {
            found.push(descriptor);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use hauler::test::{sample_image, TestStore};

    use super::*;

    /// Signs with base64(sha256(salt || payload)).
    #[derive(Debug)]
    struct FakeKey(&'static str);

    impl FakeKey {
        fn signature(&self, payload: &[u8]) -> String {
            let mut data = self.0.as_bytes().to_vec();
            data.extend_from_slice(payload);
            STANDARD.encode(Digest::sha256(&data).hex())
        }
    }

    #[async_trait]
    impl Signer for FakeKey {
        async fn sign(&self, payload: &[u8]) -> Result<String> {
            Ok(self.signature(payload))
        }
    }

    /// Accepts signatures from any of its keys.
    #[derive(Debug)]
    struct FakeKeyring(Vec<FakeKey>);

    #[async_trait]
    impl Verifier for FakeKeyring {
        async fn verify(&self, payload: &[u8], signature: &str) -> Result<()> {
            ensure!(
                self.0.iter().any(|k| k.signature(payload) == signature),
                "bad signature"
            );
            Ok(())
        }
    }

    async fn store_with_app() -> Result<(TestStore, Descriptor)> {
        let test = TestStore::new().await;
        let added = test
            .store
            .add(&sample_image(1), &"hauler/app:v1".parse()?)
            .await?;
        Ok((test, added))
    }

    #[tokio::test]
    async fn test_sign_and_verify() -> Result<()> {
        let (test, app) = store_with_app().await?;
        let store = &test.store;

        let sig = sign(store, "hauler/app:v1", &FakeKey("a")).await?;
        let expected_ref = format!("hauler/app:sha256-{}.sig", app.digest.hex());
        assert_eq!(sig.ref_name(), Some(expected_ref.as_str()));
        assert_eq!(sig.kind_annotation(), Some(Kind::Signature.as_str()));
        assert_eq!(
            sig.annotation(ANNOTATION_SUBJECT),
            Some(app.digest.to_string().as_str())
        );

        let keyring = FakeKeyring(vec![FakeKey("a"), FakeKey("b")]);
        assert_eq!(verify(store, "hauler/app:v1", &keyring).await?, 1);

        // Same key again is a no-op, a second key adds a layer.
        sign(store, "hauler/app:v1", &FakeKey("a")).await?;
        assert_eq!(verify(store, "hauler/app:v1", &keyring).await?, 1);
        sign(store, "hauler/app:v1", &FakeKey("b")).await?;
        assert_eq!(verify(store, "hauler/app:v1", &keyring).await?, 2);

        let only_a = FakeKeyring(vec![FakeKey("a")]);
        assert!(verify(store, "hauler/app:v1", &only_a).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_unsigned() -> Result<()> {
        let (test, _) = store_with_app().await?;
        let keyring = FakeKeyring(vec![FakeKey("a")]);
        let err = verify(&test.store, "hauler/app:v1", &keyring)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no signatures"), "{err}");
        assert!(verify(&test.store, "hauler/missing:v1", &keyring).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_companions_sort_after_subject() -> Result<()> {
        let (test, app) = store_with_app().await?;
        let store = &test.store;
        attach(
            store,
            "hauler/app:v1",
            Attachment::sbom("application/spdx+json", &br#"{"spdxVersion":"SPDX-2.3"}"#[..]),
        )
        .await?;
        sign(store, "hauler/app:v1", &FakeKey("a")).await?;
        sign(store, "hauler/app:v1", &FakeKey("b")).await?;

        let kinds: Vec<String> = store
            .list()
            .await
            .iter()
            .filter_map(|d| d.kind_annotation().map(str::to_string))
            .collect();
        assert_eq!(kinds[0], Kind::Image.as_str());
        assert!(kinds[1..]
            .iter()
            .all(|k| k.starts_with(hauler::kind::COSIGN_PREFIX) && k != Kind::Image.as_str()));

        let mut found: Vec<String> = referrers(store, &app.digest)
            .await?
            .iter()
            .filter_map(|d| d.ref_name().map(str::to_string))
            .collect();
        found.sort();
        let hex = app.digest.hex();
        assert_eq!(
            found,
            vec![
                format!("hauler/app:sha256-{hex}.sbom"),
                format!("hauler/app:sha256-{hex}.sig"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_attach_rejects_other_kinds() -> Result<()> {
        let (test, _) = store_with_app().await?;
        let attachment = Attachment {
            kind: Kind::Chart,
            media_type: "text/plain".into(),
            data: Bytes::from_static(b"nope"),
        };
        assert!(attach(&test.store, "hauler/app:v1", attachment).await.is_err());

        let att = attach(&test.store, "hauler/app:v1", Attachment::attestation(&b"{}"[..])).await?;
        assert_eq!(att.kind_annotation(), Some(Kind::Attestation.as_str()));
        assert!(att.ref_name().is_some_and(|r| r.ends_with(".att")));
        Ok(())
    }
}
