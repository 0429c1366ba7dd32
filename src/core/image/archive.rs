//! Raw rootfs archive fetch + extract (§4.8). Dispatches by URL extension:
//! `.gz` → tar+gzip, `.xz` → tar+xz, `.zst` → tar+zstd, `.zip` → zip. Zip is
//! buffered fully (it needs random access for its central directory); the
//! others stream straight off the HTTP body.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use futures_util::StreamExt;
use log::info;

use super::fsutil::set_parent_dirs_permissive;
use crate::core::error::{PhiockerError, Result};

/// Fetch `url`, report progress via `on_progress(bytes_read, total)` (total
/// is `None` when the server omits `Content-Length`), and extract into
/// `dest`. `dest` is created if missing.
pub async fn fetch_and_extract(
    url: &str,
    dest: &Path,
    mut on_progress: impl FnMut(u64, Option<u64>) + Send,
) -> Result<()> {
    fs::create_dir_all(dest).map_err(PhiockerError::Io)?;

    let resp = reqwest::get(url)
        .await
        .map_err(|e| PhiockerError::Other(e.into()))?;
    if !resp.status().is_success() {
        return Err(PhiockerError::user(format!(
            "download of '{url}' failed: HTTP {}",
            resp.status()
        )));
    }
    let total = resp.content_length();

    if url.ends_with(".zip") {
        let mut buf = Vec::new();
        let mut stream = resp.bytes_stream();
        let mut read = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PhiockerError::Other(e.into()))?;
            read += chunk.len() as u64;
            on_progress(read, total);
            buf.extend_from_slice(&chunk);
        }
        return extract_zip(Cursor::new(buf), dest);
    }

    let mut read = 0u64;
    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PhiockerError::Other(e.into()))?;
        read += chunk.len() as u64;
        on_progress(read, total);
        body.extend_from_slice(&chunk);
    }

    let cursor = Cursor::new(body);
    if url.ends_with(".xz") {
        let decoder = xz2::read::XzDecoder::new(cursor);
        extract_tar(decoder, dest)
    } else if url.ends_with(".zst") {
        let decoder = zstd::stream::Decoder::new(cursor).map_err(PhiockerError::Io)?;
        extract_tar(decoder, dest)
    } else {
        // default: treat as gzip, matching the `.gz` tarballs every built-in
        // short-name image resolves to.
        let decoder = flate2::read::GzDecoder::new(cursor);
        extract_tar(decoder, dest)
    }
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(PhiockerError::Io)? {
        let mut entry = entry.map_err(PhiockerError::Io)?;
        let path = entry.path().map_err(PhiockerError::Io)?.into_owned();
        let target = dest.join(&path);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target).map_err(PhiockerError::Io)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            set_parent_dirs_permissive(parent)?;
        }
        entry.unpack(&target).map_err(PhiockerError::Io)?;
    }
    info!("extracted tar archive into {}", dest.display());
    Ok(())
}

fn extract_zip<R: Read + std::io::Seek>(reader: R, dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(reader).map_err(|e| PhiockerError::Other(e.into()))?;
    for i in 0..zip.len() {
        let mut file = zip
            .by_index(i)
            .map_err(|e| PhiockerError::Other(e.into()))?;
        let target = match file.enclosed_name() {
            Some(p) => dest.join(p),
            None => continue,
        };

        if file.is_dir() {
            fs::create_dir_all(&target).map_err(PhiockerError::Io)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            set_parent_dirs_permissive(parent)?;
        }
        let mut out = fs::File::create(&target).map_err(PhiockerError::Io)?;
        std::io::copy(&mut file, &mut out).map_err(PhiockerError::Io)?;
    }
    info!("extracted zip archive into {}", dest.display());
    Ok(())
}
