//! Plain HTTP downloads with retries.

use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::{Response, StatusCode};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use url::Url;

use hauler::{Algorithm, Digest};

use crate::BuildContext;

/// A file fetched to disk.
#[derive(Debug)]
pub(crate) struct Download {
    pub(crate) digest: Digest,
    pub(crate) size: u64,
    /// File name from `Content-Disposition`, if the server sent one.
    pub(crate) filename: Option<String>,
}

async fn get(ctx: &BuildContext, url: &Url) -> Result<Response> {
    let response = ctx.http.get(url.clone()).send().await?;
    match response.status() {
        StatusCode::NOT_FOUND => Err(hauler::Error::ReferenceNotFound(url.to_string()).into()),
        status if status.is_success() => Ok(response),
        status => bail!("{url}: {status}"),
    }
}

/// Fetch `url` into memory.
pub(crate) async fn fetch_bytes(ctx: &BuildContext, url: &Url) -> Result<Bytes> {
    ctx.retry
        .run(url.as_str(), || async move {
            let response = get(ctx, url).await?;
            Ok::<_, anyhow::Error>(response.bytes().await?)
        })
        .await
}

/// Fetch `url` into `dest`, hashing on the way.
pub(crate) async fn fetch_to_file(ctx: &BuildContext, url: &Url, dest: &Path) -> Result<Download> {
    ctx.retry
        .run(url.as_str(), || async move {
            let response = get(ctx, url).await?;
            let filename = response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(disposition_filename);
            let mut file = tokio::fs::File::create(dest)
                .await
                .with_context(|| format!("Creating {}", dest.display()))?;
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.try_next().await? {
                hasher.update(&chunk);
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            let digest = Digest::new(Algorithm::Sha256, format!("{:x}", hasher.finalize()))?;
            Ok::<_, anyhow::Error>(Download {
                digest,
                size,
                filename,
            })
        })
        .await
}

/// The `filename` parameter of a `Content-Disposition` value.
pub(crate) fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let name = value.rsplit(['/', '\\']).next().unwrap_or(value);
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_filename() {
        let cases = [
            ("attachment; filename=\"k3s-arm64\"", Some("k3s-arm64")),
            ("attachment; filename=install.sh", Some("install.sh")),
            ("attachment; FileName=\"../../etc/passwd\"", Some("passwd")),
            ("attachment", None),
            ("inline; filename=\"\"", None),
        ];
        for (value, expected) in cases {
            assert_eq!(disposition_filename(value).as_deref(), expected, "{value}");
        }
    }
}
