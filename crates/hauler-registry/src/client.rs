//! A distribution v2 client.
//!
//! Covers exactly what pulling into and pushing out of a store needs:
//! manifests by tag or digest, blobs by digest, monolithic blob uploads and
//! manifest pushes. Authentication follows the registry's
//! `WWW-Authenticate` challenge and caches the resulting header per host and
//! scope, so a pull of many blobs negotiates a token once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use fn_error_context::context;
use futures::TryStreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

use hauler::descriptor::{
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use hauler::{BlobReader, Digest, ManifestDocument, Reference};

use crate::auth::{Anonymous, Challenge, CredentialResolver, TokenResponse};

/// Host that serves Docker Hub's registry API.
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

/// Manifest types requested when resolving.
pub const MANIFEST_ACCEPT: [&str; 4] = [
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

const PULL: &str = "pull";
const PUSH: &str = "pull,push";

/// Client options.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Hosts reached over plain HTTP. Loopback hosts always are.
    pub plain_http: HashSet<String>,
}

impl ClientConfig {
    /// Reach `host` over plain HTTP.
    pub fn with_plain_http(mut self, host: impl Into<String>) -> Self {
        self.plain_http.insert(host.into());
        self
    }

    /// Whether requests to `host` use `http://`.
    pub fn uses_plain_http(&self, host: &str) -> bool {
        self.plain_http.contains(host) || is_loopback(host)
    }
}

fn is_loopback(host: &str) -> bool {
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        }
    };
    bare == "localhost" || bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Where a reference lives remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Registry host, with port.
    pub host: String,
    /// Repository path on that host.
    pub repository: String,
}

impl Endpoint {
    /// Locate `reference`, applying Docker Hub normalisation.
    ///
    /// A reference without a registry, or naming `docker.io`, goes to
    /// [`DOCKER_HUB_HOST`], where single-component repositories live under
    /// `library/`.
    pub fn of(reference: &Reference) -> Self {
        let host = match reference.registry() {
            None | Some("docker.io") | Some("index.docker.io") => DOCKER_HUB_HOST,
            Some(host) => host,
        };
        let repository = reference.repository();
        let repository = if host == DOCKER_HUB_HOST && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };
        Endpoint {
            host: host.to_string(),
            repository,
        }
    }
}

/// A manifest fetched from a registry.
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    /// Raw bytes, exactly as served.
    pub data: Bytes,
    /// Media type from `Content-Type`, or the document itself.
    pub media_type: String,
    /// Digest of `data`.
    pub digest: Digest,
}

impl RemoteManifest {
    /// Parse the body.
    pub fn document(&self) -> hauler::Result<ManifestDocument> {
        ManifestDocument::parse(&self.data, Some(&self.media_type))
    }
}

/// Distribution v2 client with challenge-based auth.
#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    config: Arc<ClientConfig>,
    credentials: Arc<dyn CredentialResolver>,
    tokens: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Anonymous client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("hauler/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(RegistryClient {
            http,
            config: Arc::new(config),
            credentials: Arc::new(Anonymous),
            tokens: Default::default(),
        })
    }

    /// Use `resolver` for credentials.
    pub fn with_credentials(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = resolver;
        self
    }

    /// The underlying HTTP client.
    pub fn http(&self) -> &Client {
        &self.http
    }

    fn url(&self, endpoint: &Endpoint, path: &str) -> Result<Url> {
        let scheme = if self.config.uses_plain_http(&endpoint.host) {
            "http"
        } else {
            "https"
        };
        let url = format!(
            "{scheme}://{}/v2/{}/{path}",
            endpoint.host, endpoint.repository
        );
        Url::parse(&url).with_context(|| format!("invalid registry URL {url}"))
    }

    async fn cached_auth(&self, endpoint: &Endpoint, actions: &str) -> Option<String> {
        let key = (endpoint.host.clone(), scope(endpoint, actions));
        self.tokens.lock().await.get(&key).cloned()
    }

    /// Send a request built by `make`, answering one auth challenge.
    async fn send<F>(&self, endpoint: &Endpoint, actions: &str, make: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = make(&self.http);
        if let Some(auth) = self.cached_auth(endpoint, actions).await {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
        else {
            return Ok(response);
        };
        let wanted = scope(endpoint, actions);
        let auth = self.authorize(&endpoint.host, &challenge, &wanted).await?;
        self.tokens
            .lock()
            .await
            .insert((endpoint.host.clone(), wanted), auth.clone());
        Ok(make(&self.http).header(AUTHORIZATION, auth).send().await?)
    }

    async fn authorize(&self, host: &str, challenge: &Challenge, wanted: &str) -> Result<String> {
        let credentials = self.credentials.resolve(host).await?;
        match challenge {
            Challenge::Basic { .. } => credentials
                .map(|c| c.basic_header())
                .with_context(|| format!("{host} requires credentials")),
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let mut url = Url::parse(realm).with_context(|| format!("invalid token realm {realm}"))?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = service {
                        query.append_pair("service", service);
                    }
                    query.append_pair("scope", scope.as_deref().unwrap_or(wanted));
                }
                let mut request = self.http.get(url);
                if let Some(c) = &credentials {
                    request = request.basic_auth(&c.username, Some(&c.password));
                }
                let response = request.send().await?.error_for_status()?;
                let token: TokenResponse = response.json().await?;
                let token = token
                    .into_token()
                    .with_context(|| format!("token endpoint {realm} returned no token"))?;
                tracing::debug!("obtained token for {host} ({wanted})");
                Ok(format!("Bearer {token}"))
            }
        }
    }

    /// Fetch the manifest `reference` points at.
    ///
    /// A digest-pinned reference is verified against the body.
    #[context("Resolving manifest {reference}")]
    pub async fn resolve_manifest(&self, reference: &Reference) -> Result<RemoteManifest> {
        let endpoint = Endpoint::of(reference);
        let url = self.url(&endpoint, &format!("manifests/{}", reference.identifier()))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let response = self
            .send(&endpoint, PULL, |http| {
                http.get(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(hauler::Error::ReferenceNotFound(reference.to_string()).into());
        }
        let response = check(response).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
        let data = response.bytes().await?;

        let digest = match reference.digest() {
            Some(expected) => {
                let actual = Digest::compute(expected.algorithm(), &data);
                if actual != *expected {
                    return Err(hauler::Error::DigestMismatch {
                        expected: expected.clone(),
                        actual,
                    }
                    .into());
                }
                actual
            }
            None => Digest::sha256(&data),
        };
        let declared = content_type.filter(|ct| MANIFEST_ACCEPT.contains(&ct.as_str()));
        let document = ManifestDocument::parse(&data, declared.as_deref())?;
        let media_type = document
            .media_type(declared.as_deref().unwrap_or(MEDIA_TYPE_OCI_MANIFEST))
            .to_string();
        Ok(RemoteManifest {
            data,
            media_type,
            digest,
        })
    }

    async fn get_blob(&self, reference: &Reference, digest: &Digest) -> Result<Response> {
        let endpoint = Endpoint::of(reference);
        let url = self.url(&endpoint, &format!("blobs/{digest}"))?;
        let response = self.send(&endpoint, PULL, |http| http.get(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(hauler::Error::BlobNotFound(digest.clone()).into());
        }
        check(response).await
    }

    /// Stream the blob `digest` from the repository of `reference`.
    ///
    /// The bytes are not verified here; writing them into the CAS does that.
    #[context("Fetching blob {digest} from {reference}")]
    pub async fn fetch_blob(&self, reference: &Reference, digest: &Digest) -> Result<BlobReader> {
        let response = self.get_blob(reference, digest).await?;
        let stream = response.bytes_stream().map_err(io::Error::other);
        let reader: BlobReader = Box::pin(StreamReader::new(stream));
        Ok(reader)
    }

    /// Fetch a whole blob into memory and verify it.
    #[context("Fetching blob {digest} from {reference}")]
    pub async fn fetch_blob_bytes(&self, reference: &Reference, digest: &Digest) -> Result<Bytes> {
        let data = self.get_blob(reference, digest).await?.bytes().await?;
        let actual = Digest::compute(digest.algorithm(), &data);
        if actual != *digest {
            return Err(hauler::Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            }
            .into());
        }
        Ok(data)
    }

    /// Whether the repository of `reference` holds `digest`.
    #[context("Checking blob {digest} at {reference}")]
    pub async fn blob_exists(&self, reference: &Reference, digest: &Digest) -> Result<bool> {
        let endpoint = Endpoint::of(reference);
        let url = self.url(&endpoint, &format!("blobs/{digest}"))?;
        let response = self.send(&endpoint, PUSH, |http| http.head(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => bail!("unexpected status {status}"),
        }
    }

    /// Upload one blob: POST to open a session, then a single PUT.
    #[context("Uploading blob {digest} to {reference}")]
    pub async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        size: u64,
        reader: BlobReader,
    ) -> Result<()> {
        let endpoint = Endpoint::of(reference);
        let start = self.url(&endpoint, "blobs/uploads/")?;
        let response = self
            .send(&endpoint, PUSH, |http| {
                http.post(start.clone()).header(CONTENT_LENGTH, 0)
            })
            .await?;
        let response = check(response).await?;
        if response.status() == StatusCode::CREATED {
            return Ok(());
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("upload response has no Location")?;
        let mut url = start
            .join(location)
            .with_context(|| format!("invalid upload location {location}"))?;
        url.query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let mut request = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body);
        if let Some(auth) = self.cached_auth(&endpoint, PUSH).await {
            request = request.header(AUTHORIZATION, auth);
        }
        check(request.send().await?).await?;
        tracing::debug!("uploaded {digest} to {}/{}", endpoint.host, endpoint.repository);
        Ok(())
    }

    /// Push a manifest under the tag or digest of `reference`.
    #[context("Pushing manifest to {reference}")]
    pub async fn put_manifest(&self, reference: &Reference, data: &[u8], media_type: &str) -> Result<()> {
        let endpoint = Endpoint::of(reference);
        let url = self.url(&endpoint, &format!("manifests/{}", reference.identifier()))?;
        let data = Bytes::copy_from_slice(data);
        let response = self
            .send(&endpoint, PUSH, |http| {
                http.put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(data.clone())
            })
            .await?;
        check(response).await?;
        Ok(())
    }
}

fn scope(endpoint: &Endpoint, actions: &str) -> String {
    format!("repository:{}:{actions}", endpoint.repository)
}

/// Turn a non-success response into an error carrying the registry's message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        bail!("{url}: {status}");
    }
    bail!("{url}: {status}: {}", body.chars().take(512).collect::<String>())
}
