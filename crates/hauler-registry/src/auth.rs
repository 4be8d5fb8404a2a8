//! Registry credentials and `WWW-Authenticate` challenges.
//!
//! Credentials are looked up per host through a [`CredentialResolver`]; the
//! store never sees them. A 401 carries a challenge that either asks for
//! Basic credentials directly or points at a token realm which exchanges
//! them (or nothing, for anonymous pulls) for a Bearer token.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fn_error_context::context;
use serde::Deserialize;

/// A username and password (or identity token) for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Build from parts.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Authorization` header value for Basic auth.
    pub fn basic_header(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

/// Looks up credentials for a registry host.
#[async_trait]
pub trait CredentialResolver: Send + Sync + fmt::Debug {
    /// Credentials for `host`, or `None` to proceed anonymously.
    async fn resolve(&self, host: &str) -> Result<Option<Credentials>>;
}

/// Never returns credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl CredentialResolver for Anonymous {
    async fn resolve(&self, _host: &str) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

/// A fixed host to credentials map.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    hosts: HashMap<String, Credentials>,
}

impl StaticCredentials {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials for `host`.
    pub fn with(mut self, host: impl Into<String>, credentials: Credentials) -> Self {
        self.hosts.insert(host.into(), credentials);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, host: &str) -> Result<Option<Credentials>> {
        Ok(self.hosts.get(host).cloned())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

/// Reads the `auths` section of a docker `config.json`.
///
/// Credential helpers are not consulted.
#[derive(Debug, Default, Clone)]
pub struct DockerConfig {
    hosts: HashMap<String, Credentials>,
}

impl DockerConfig {
    /// Default location: `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker/config.json"))
    }

    /// Load the default file; a missing file yields no credentials.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load `path`.
    #[context("Loading docker config {}", path.display())]
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Parse the contents of a `config.json`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let file: DockerConfigFile = serde_json::from_slice(data)?;
        let mut hosts = HashMap::new();
        for (key, entry) in file.auths {
            let credentials = match (entry.auth, entry.username, entry.password, entry.identity_token) {
                (_, Some(user), _, Some(token)) => Credentials::new(user, token),
                (_, Some(user), Some(pass), None) => Credentials::new(user, pass),
                (Some(auth), _, _, _) => {
                    let decoded = STANDARD
                        .decode(auth.trim())
                        .with_context(|| format!("decoding auth for {key}"))?;
                    let decoded = String::from_utf8(decoded)
                        .with_context(|| format!("decoding auth for {key}"))?;
                    let (user, pass) = decoded
                        .split_once(':')
                        .with_context(|| format!("auth for {key} is not user:password"))?;
                    Credentials::new(user, pass)
                }
                _ => continue,
            };
            hosts.insert(normalize_config_key(&key), credentials);
        }
        Ok(DockerConfig { hosts })
    }
}

/// `https://index.docker.io/v1/` style keys become bare hosts.
fn normalize_config_key(key: &str) -> String {
    let host = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "docker.io" => crate::client::DOCKER_HUB_HOST.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl CredentialResolver for DockerConfig {
    async fn resolve(&self, host: &str) -> Result<Option<Credentials>> {
        Ok(self.hosts.get(host).cloned())
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Send Basic credentials with every request.
    Basic {
        /// Protection space.
        realm: Option<String>,
    },
    /// Fetch a token from `realm`.
    Bearer {
        /// Token endpoint.
        realm: String,
        /// Service name to request the token for.
        service: Option<String>,
        /// Scope the registry asked for.
        scope: Option<String>,
    },
}

/// Split `key="value", key2=value2` into pairs, honoring quotes.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            (value, &quoted[end..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim().to_string(), &after[end..])
        };
        params.insert(key, value);
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

impl Challenge {
    /// Parse a `WWW-Authenticate` value.
    pub fn parse(header: &str) -> Option<Challenge> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let mut params = parse_params(params);
        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Some(Challenge::Basic {
                realm: params.remove("realm"),
            }),
            "bearer" => Some(Challenge::Bearer {
                realm: params.remove("realm")?,
                service: params.remove("service"),
                scope: params.remove("scope"),
            }),
            _ => None,
        }
    }
}

/// Body of a token endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token.or(self.access_token).filter(|t| !t.is_empty())
    }
}
