//! Registry-style references: `[host[:port]/]repository[:tag][@digest]`.
//!
//! The leading component is treated as a registry host only when more
//! components follow and it contains `.` or `:`, or is exactly `localhost`.
//! This is the same heuristic the docker CLI applies, and it is what makes
//! host rewriting during copy a pure substitution at the first `/`.

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Namespace prepended to bare names by [`Reference::with_default_namespace`].
pub const DEFAULT_NAMESPACE: &str = "hauler";

/// Tag applied when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

fn is_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
}

fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(first)
        && alnum(last)
        && bytes
            .iter()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
}

fn valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    match bytes.first() {
        Some(b'.') | Some(b'-') | None => false,
        Some(_) => {
            bytes.len() <= 128
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
        }
    }
}

impl Reference {
    /// Parse, prepending [`DEFAULT_NAMESPACE`] when `input` has no `/`.
    ///
    /// A host-only input such as `localhost:5000` therefore becomes
    /// `hauler/localhost:5000`, i.e. repository `hauler/localhost` with tag
    /// `5000`. The rule looks only at the presence of `/`.
    pub fn with_default_namespace(input: &str) -> Result<Self> {
        if input.contains('/') {
            input.parse()
        } else {
            format!("{DEFAULT_NAMESPACE}/{input}").parse()
        }
    }

    /// Build from validated parts.
    pub fn new(
        registry: Option<&str>,
        repository: &str,
        tag: Option<&str>,
        digest: Option<Digest>,
    ) -> Result<Self> {
        let invalid = || {
            Error::InvalidReference(format!(
                "{}{repository}{}",
                registry.map(|r| format!("{r}/")).unwrap_or_default(),
                tag.map(|t| format!(":{t}")).unwrap_or_default()
            ))
        };
        if let Some(host) = registry {
            if !valid_host(host) {
                return Err(invalid());
            }
        }
        if repository.is_empty() || !repository.split('/').all(valid_path_component) {
            return Err(invalid());
        }
        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid());
            }
        }
        Ok(Reference {
            registry: registry.map(str::to_string),
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Registry host, if the reference names one.
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// Repository path without the host.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The pinned digest, if any.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// `[host/]repository`.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(host) => format!("{host}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    /// The digest if pinned, otherwise the tag, otherwise `latest`.
    pub fn identifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Replace (or set) the registry host.
    pub fn with_registry(&self, host: &str) -> Result<Self> {
        Self::new(
            Some(host),
            &self.repository,
            self.tag.as_deref(),
            self.digest.clone(),
        )
    }

    /// Drop the registry host.
    pub fn without_registry(&self) -> Self {
        Reference {
            registry: None,
            ..self.clone()
        }
    }

    /// Replace the tag, keeping any digest.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        Self::new(
            self.registry.as_deref(),
            &self.repository,
            Some(tag),
            self.digest.clone(),
        )
    }

    /// Pin to `digest`, dropping the tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Reference {
            tag: None,
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Apply [`DEFAULT_TAG`] when neither tag nor digest is present.
    pub fn or_latest(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.registry {
            write!(f, "{host}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidReference(input.to_string());

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<Digest>().map_err(|_| invalid())?)),
            None => (input, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name[..colon], Some(&name[colon + 1..]))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_host(first) => (Some(first), rest),
            _ => (None, name),
        };

        Reference::new(registry, repository, tag, digest).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let cases: &[(&str, Option<&str>, &str, Option<&str>)] = &[
            ("busybox", None, "busybox", None),
            ("library/busybox:1.34.1", None, "library/busybox", Some("1.34.1")),
            (
                "docker.io/library/busybox:1.34.1",
                Some("docker.io"),
                "library/busybox",
                Some("1.34.1"),
            ),
            (
                "localhost:5000/app/web:v2",
                Some("localhost:5000"),
                "app/web",
                Some("v2"),
            ),
            ("localhost/app", Some("localhost"), "app", None),
            ("hauler/k3s:v1.30.1-k3s1", None, "hauler/k3s", Some("v1.30.1-k3s1")),
        ];
        for (input, registry, repository, tag) in cases {
            let r: Reference = input.parse().unwrap();
            assert_eq!(r.registry(), *registry, "{input}");
            assert_eq!(r.repository(), *repository, "{input}");
            assert_eq!(r.tag(), *tag, "{input}");
            assert_eq!(r.to_string(), *input);
        }
    }

    #[test]
    fn test_parse_digest() {
        let digest = Digest::sha256(b"m");
        let input = format!("quay.io/org/app:1.0@{digest}");
        let r: Reference = input.parse().unwrap();
        assert_eq!(r.registry(), Some("quay.io"));
        assert_eq!(r.tag(), Some("1.0"));
        assert_eq!(r.digest(), Some(&digest));
        assert_eq!(r.identifier(), digest.to_string());
        assert_eq!(r.to_string(), input);
    }

    #[test]
    fn test_default_namespace() {
        let r = Reference::with_default_namespace("cert-manager:1.15.3").unwrap();
        assert_eq!(r.to_string(), "hauler/cert-manager:1.15.3");

        let r = Reference::with_default_namespace("library/busybox:1.34.1").unwrap();
        assert_eq!(r.to_string(), "library/busybox:1.34.1");

        // host-only inputs have no '/' and get the namespace too
        let r = Reference::with_default_namespace("localhost:5000").unwrap();
        assert_eq!(r.repository(), "hauler/localhost");
        assert_eq!(r.tag(), Some("5000"));
    }

    #[test]
    fn test_registry_rewrite() {
        let r: Reference = "library/busybox:1.34.1".parse().unwrap();
        let moved = r.with_registry("example.com:5000").unwrap();
        assert_eq!(moved.to_string(), "example.com:5000/library/busybox:1.34.1");

        let again = moved.with_registry("registry.local").unwrap();
        assert_eq!(again.to_string(), "registry.local/library/busybox:1.34.1");
        assert_eq!(again.without_registry(), r);
    }

    #[test]
    fn test_or_latest() {
        let r: Reference = "hauler/file.txt".parse().unwrap();
        assert_eq!(r.identifier(), "latest");
        assert_eq!(r.or_latest().to_string(), "hauler/file.txt:latest");
    }

    #[test]
    fn test_rejects_invalid() {
        for bad in ["", "UPPER/case", "a//b", "repo:", "repo:-tag", "repo@sha256:zz", "/x"] {
            assert!(bad.parse::<Reference>().is_err(), "{bad:?} should not parse");
        }
    }
}
