//! OCI registry pull (§4.8): given `repo[:tag]`, fetch the manifest, then
//! every layer, and extract each into the target directory. Directory
//! entries create directories; regular files create parents as needed and
//! write with the archived mode; other tar entry types are skipped.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use super::fsutil::set_parent_dirs_permissive;
use crate::core::error::{PhiockerError, Result};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const AUTH_HOST: &str = "auth.docker.io";
const DEFAULT_TAG: &str = "latest";

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json,",
    "application/vnd.oci.image.manifest.v1+json,",
    "application/vnd.docker.distribution.manifest.list.v2+json,",
    "application/vnd.oci.image.index.v1+json"
);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct TagsList {
    #[serde(default)]
    tags: Vec<String>,
}

/// Lists tags for `repo` (no tag suffix expected), capped at `limit` entries.
/// A thin client-facing wrapper over the registry's tag-listing endpoint —
/// this is the one piece of registry interaction the daemon exposes without
/// also fetching a manifest or any layers.
pub async fn search(repo: &str, limit: Option<usize>) -> Result<Vec<String>> {
    let repo = normalize_repo(repo);
    let client = reqwest::Client::new();
    let token = fetch_token(&client, &repo).await?;

    let url = format!("https://{DEFAULT_REGISTRY}/v2/{repo}/tags/list");
    let mut req = client.get(&url);
    if let Some(t) = &token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PhiockerError::Other(e.into()))?;
    if !resp.status().is_success() {
        return Err(PhiockerError::user(format!(
            "failed to list tags for '{repo}': HTTP {}",
            resp.status()
        )));
    }
    let mut list: TagsList = resp.json().await.map_err(|e| PhiockerError::Other(e.into()))?;
    list.tags.sort();
    if let Some(limit) = limit {
        list.tags.truncate(limit);
    }
    Ok(list.tags)
}

/// `name[:tag]` split into its repository and tag (defaulting to `latest`).
fn parse_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        // A colon that looks like a port (`host:5000/repo`) isn't a tag
        // separator; only split when what follows has no slash.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), DEFAULT_TAG.to_string()),
    }
}

fn normalize_repo(repo: &str) -> String {
    if repo.contains('/') {
        repo.to_string()
    } else {
        format!("library/{repo}")
    }
}

async fn fetch_token(client: &reqwest::Client, repo: &str) -> Result<Option<String>> {
    let url = format!(
        "https://{AUTH_HOST}/token?service=registry.docker.io&scope=repository:{repo}:pull"
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| PhiockerError::Other(e.into()))?;
    if !resp.status().is_success() {
        return Ok(None);
    }
    let body: TokenResponse = resp
        .json()
        .await
        .map_err(|e| PhiockerError::Other(e.into()))?;
    Ok(body.token.or(body.access_token))
}

/// Pull `reference` (e.g. `debian:bookworm`, `library/alpine`) into `dest`.
pub async fn pull(reference: &str, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(PhiockerError::Io)?;

    let (repo_part, tag) = parse_reference(reference);
    let repo = normalize_repo(&repo_part);

    let client = reqwest::Client::new();
    let token = fetch_token(&client, &repo).await?;

    let manifest = fetch_manifest(&client, &repo, &tag, token.as_deref()).await?;
    let manifest = resolve_platform_manifest(&client, &repo, manifest, token.as_deref()).await?;

    if manifest.layers.is_empty() {
        return Err(PhiockerError::user(format!(
            "manifest for '{reference}' has no layers"
        )));
    }

    for layer in &manifest.layers {
        debug!("fetching layer {} ({})", layer.digest, layer.media_type);
        let blob = fetch_blob(&client, &repo, &layer.digest, token.as_deref()).await?;
        extract_layer(&blob, dest)?;
    }

    info!("pulled '{reference}' into {}", dest.display());
    Ok(())
}

async fn fetch_manifest(
    client: &reqwest::Client,
    repo: &str,
    tag: &str,
    token: Option<&str>,
) -> Result<Manifest> {
    let url = format!("https://{DEFAULT_REGISTRY}/v2/{repo}/manifests/{tag}");
    let mut req = client.get(&url).header("Accept", MANIFEST_ACCEPT);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PhiockerError::Other(e.into()))?;
    if !resp.status().is_success() {
        return Err(PhiockerError::user(format!(
            "failed to fetch manifest for '{repo}:{tag}': HTTP {}",
            resp.status()
        )));
    }
    resp.json().await.map_err(|e| PhiockerError::Other(e.into()))
}

/// A `manifests` field means we got an index/manifest-list; pick the
/// linux/amd64 entry and fetch its manifest. Otherwise the manifest we have
/// is already the image manifest.
async fn resolve_platform_manifest(
    client: &reqwest::Client,
    repo: &str,
    manifest: Manifest,
    token: Option<&str>,
) -> Result<Manifest> {
    if manifest.manifests.is_empty() {
        return Ok(manifest);
    }

    let chosen = manifest
        .manifests
        .iter()
        .find(|d| {
            d.platform
                .as_ref()
                .map(|p| p.architecture == "amd64" && p.os == "linux")
                .unwrap_or(false)
        })
        .or_else(|| manifest.manifests.first())
        .ok_or_else(|| PhiockerError::user("manifest list has no entries"))?;

    let url = format!("https://{DEFAULT_REGISTRY}/v2/{repo}/manifests/{}", chosen.digest);
    let mut req = client.get(&url).header("Accept", MANIFEST_ACCEPT);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PhiockerError::Other(e.into()))?;
    resp.json().await.map_err(|e| PhiockerError::Other(e.into()))
}

async fn fetch_blob(
    client: &reqwest::Client,
    repo: &str,
    digest: &str,
    token: Option<&str>,
) -> Result<bytes::Bytes> {
    let url = format!("https://{DEFAULT_REGISTRY}/v2/{repo}/blobs/{digest}");
    let mut req = client.get(&url);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PhiockerError::Other(e.into()))?;
    if !resp.status().is_success() {
        return Err(PhiockerError::user(format!(
            "failed to fetch blob '{digest}': HTTP {}",
            resp.status()
        )));
    }
    resp.bytes().await.map_err(|e| PhiockerError::Other(e.into()))
}

fn extract_layer(blob: &[u8], dest: &Path) -> Result<()> {
    let gz = flate2::read::GzDecoder::new(blob);
    let mut archive = tar::Archive::new(gz);
    for entry in archive.entries().map_err(PhiockerError::Io)? {
        let mut entry = entry.map_err(PhiockerError::Io)?;
        let path = entry.path().map_err(PhiockerError::Io)?.into_owned();
        let target = dest.join(&path);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target).map_err(PhiockerError::Io)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if let Some(parent) = target.parent() {
            set_parent_dirs_permissive(parent)?;
        }
        entry.unpack(&target).map_err(PhiockerError::Io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_splits_tag() {
        assert_eq!(parse_reference("alpine:3.19"), ("alpine".into(), "3.19".into()));
        assert_eq!(parse_reference("alpine"), ("alpine".into(), "latest".into()));
    }

    #[test]
    fn parse_reference_ignores_registry_port_colon() {
        assert_eq!(
            parse_reference("myregistry:5000/app"),
            ("myregistry:5000/app".into(), "latest".into())
        );
    }

    #[test]
    fn normalize_repo_adds_library_prefix() {
        assert_eq!(normalize_repo("alpine"), "library/alpine");
        assert_eq!(normalize_repo("someuser/app"), "someuser/app");
    }
}
