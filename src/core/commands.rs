//! Subcommand glue (C10, §4.10): create/list/delete/update/ps, each called
//! from the control server's dispatch table with raw string args.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use tabwriter::TabWriter;

use super::config::ContainerSpec;
use super::error::{PhiockerError, Result};
use super::image::{self, archive, fsutil, oci, KNOWN_IMAGES};
use super::registry::Registry;

const LARGE_DIRECTORY_BYTES: u64 = 100 * 1024 * 1024;
const PROGRESS_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Builds a 500ms-throttled stderr progress callback for raw-archive fetches,
/// matching the original's ticker-driven `printProgress`. Runs on the
/// daemon's own stderr: the control protocol is request/response, not a
/// stream, so there is no channel back to the client mid-download.
fn progress_reporter() -> impl FnMut(u64, Option<u64>) + Send {
    use std::io::Write;
    let mut last = None;
    move |read, total| {
        let now = std::time::Instant::now();
        if last.is_some_and(|l| now.duration_since(l) < PROGRESS_INTERVAL) {
            return;
        }
        last = Some(now);
        match total {
            Some(total) if total > 0 => {
                let percent = read as f64 / total as f64 * 100.0;
                eprint!(
                    "\rDownloading: {:.1} MB / {:.1} MB ({:.0}%)",
                    read as f64 / (1024.0 * 1024.0),
                    total as f64 / (1024.0 * 1024.0),
                    percent
                );
            }
            _ => eprint!("\rDownloading: {:.1} MB", read as f64 / (1024.0 * 1024.0)),
        }
        let _ = std::io::stderr().flush();
    }
}

pub fn ps(registry: &Registry) -> Result<String> {
    let mut tw = TabWriter::new(Vec::new());
    use std::io::Write;
    let _ = writeln!(tw, "NAME\tPID\tUPTIME");
    for (name, pid, uptime) in registry.list() {
        let _ = writeln!(tw, "{name}\t{pid}\t{}s", uptime.as_secs());
    }
    let _ = tw.flush();
    Ok(String::from_utf8_lossy(&tw.into_inner().unwrap_or_default()).into_owned())
}

pub async fn stop(args: &[String], registry: &Registry) -> Result<String> {
    let name = args
        .first()
        .ok_or_else(|| PhiockerError::user("stop requires a container name"))?;

    let (container, mux) = match registry.remove(name) {
        Some(pair) => pair,
        None => return Err(PhiockerError::user(format!("container '{name}' is not running"))),
    };
    // Close every daemon-held copy of the PTY master before signaling, so the
    // hang-up actually reaches the child's controlling terminal (§4.3).
    mux.close_master().await;
    container.stop().await;
    Ok(format!("container '{name}' stopped\n"))
}

pub fn list(args: &[String], base_path: &Path) -> Result<String> {
    let target = args.first().map(String::as_str).unwrap_or("containers");
    let dir = match target {
        "images" => base_path.join("images"),
        _ => base_path.join("containers"),
    };

    if !dir.exists() {
        return Ok(format!("no {target} directory found\n"));
    }

    let mut out = String::new();
    let mut entries: Vec<_> = fs::read_dir(&dir)
        .map_err(PhiockerError::Io)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    if entries.is_empty() {
        return Ok(format!("no {target} found\n"));
    }

    for entry in entries {
        let size = fsutil::directory_size(&entry.path()).unwrap_or(0);
        out.push_str(&format!(
            "  - {} ({})\n",
            entry.file_name().to_string_lossy(),
            human_size(size)
        ));
    }
    Ok(out)
}

fn human_size(bytes: u64) -> String {
    if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Ensures `base_path/images/<image>/rootfs` exists and is non-empty,
/// pulling it (short-name archive or OCI reference) if not (§4.10, §8).
async fn ensure_base_image(base_path: &Path, image: &str) -> Result<PathBuf> {
    let image_rootfs = base_path.join("images").join(image).join("rootfs");

    let needs_pull = !image_rootfs.exists() || fsutil::is_empty_dir(&image_rootfs)?;
    if needs_pull {
        info!("base image '{image}' missing or empty, fetching");
        fs::create_dir_all(&image_rootfs).map_err(PhiockerError::Io)?;
        if let Some(url) = KNOWN_IMAGES.get(image) {
            archive::fetch_and_extract(url, &image_rootfs, progress_reporter()).await?;
            eprintln!();
        } else {
            oci::pull(image, &image_rootfs).await?;
        }
    }
    Ok(image_rootfs)
}

pub async fn create(args: &[String], base_path: &Path) -> Result<String> {
    let spec_path = args
        .first()
        .ok_or_else(|| PhiockerError::user("create requires a spec file path"))?;
    let spec_path = Path::new(spec_path)
        .canonicalize()
        .map_err(|e| PhiockerError::user(format!("spec file '{spec_path}' not found: {e}")))?;

    let spec = ContainerSpec::load(&spec_path)?;
    spec.validate(false)?;

    let container_dir = base_path.join("containers").join(&spec.name);
    if container_dir.exists() {
        return Err(PhiockerError::user(format!(
            "container '{}' already exists",
            spec.name
        )));
    }

    for copy in &spec.copy {
        let src = resolve_copy_src(&spec_path, &copy.src);
        if !src.exists() {
            return Err(PhiockerError::user(format!(
                "copy source '{}' does not exist",
                src.display()
            )));
        }
    }

    let image_rootfs = ensure_base_image(base_path, &spec.base_image).await?;

    let rootfs = container_dir.join("rootfs");
    fs::create_dir_all(&rootfs).map_err(PhiockerError::Io)?;
    fsutil::copy_tree(&image_rootfs, &rootfs)?;

    for copy in &spec.copy {
        let src = resolve_copy_src(&spec_path, &copy.src);
        let dst = rootfs.join(copy.dst.trim_start_matches('/'));
        fsutil::copy_tree(&src, &dst)?;
    }

    if spec.workdir != "/" {
        let workdir = rootfs.join(spec.workdir.trim_start_matches('/'));
        fs::create_dir_all(&workdir).map_err(PhiockerError::Io)?;
    }

    let config_json = fs::read_to_string(&spec_path).map_err(PhiockerError::Io)?;
    fs::write(container_dir.join("config.json"), config_json).map_err(PhiockerError::Io)?;

    Ok(format!("container '{}' created\n", spec.name))
}

fn resolve_copy_src(spec_path: &Path, src: &str) -> PathBuf {
    let p = Path::new(src);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        spec_path
            .parent()
            .map(|dir| dir.join(p))
            .unwrap_or_else(|| p.to_path_buf())
    }
}

pub fn delete(args: &[String], base_path: &Path, registry: &Registry) -> Result<String> {
    let what = args
        .first()
        .ok_or_else(|| PhiockerError::user("delete requires a target"))?;

    match what.as_str() {
        "all" => delete_all(base_path.join("containers"), Some(registry)),
        "image" => {
            let target = args
                .get(1)
                .ok_or_else(|| PhiockerError::user("delete image requires a name or 'all'"))?;
            if target == "all" {
                delete_all(base_path.join("images"), None)
            } else {
                delete_one(&base_path.join("images").join(target), None, target)
            }
        }
        name => delete_one(&base_path.join("containers").join(name), Some(registry), name),
    }
}

fn delete_one(path: &Path, registry: Option<&Registry>, name: &str) -> Result<String> {
    if let Some(registry) = registry {
        if registry.contains(name) {
            return Err(PhiockerError::user(format!(
                "container '{name}' is running; stop it before deleting"
            )));
        }
    }
    if !path.exists() {
        return Ok(format!("'{name}' does not exist\n"));
    }
    let size = fsutil::directory_size(path).unwrap_or(0);
    fs::remove_dir_all(path).map_err(PhiockerError::Io)?;
    if size > LARGE_DIRECTORY_BYTES {
        Ok(format!(
            "'{name}' deleted ({} reclaimed)\n",
            human_size(size)
        ))
    } else {
        Ok(format!("'{name}' deleted\n"))
    }
}

fn delete_all(dir: PathBuf, registry: Option<&Registry>) -> Result<String> {
    if !dir.exists() {
        return Ok("nothing to delete\n".to_string());
    }
    let mut deleted = 0;
    let mut skipped = 0;
    for entry in fs::read_dir(&dir).map_err(PhiockerError::Io)?.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if registry.is_some_and(|r| r.contains(&name)) {
            skipped += 1;
            continue;
        }
        if fs::remove_dir_all(entry.path()).is_ok() {
            deleted += 1;
        }
    }
    Ok(format!(
        "deleted {deleted} entr{}, skipped {skipped} running\n",
        if deleted == 1 { "y" } else { "ies" }
    ))
}

pub async fn update(args: &[String], base_path: &Path) -> Result<String> {
    let target = args
        .first()
        .ok_or_else(|| PhiockerError::user("update requires an image name or 'all'"))?;

    let images_dir = base_path.join("images");
    if target == "all" {
        if !images_dir.exists() {
            return Ok("no images directory found\n".to_string());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&images_dir).map_err(PhiockerError::Io)?.filter_map(|e| e.ok()) {
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        let mut ok = 0;
        let mut failed = 0;
        for name in &names {
            match update_one(&images_dir, name).await {
                Ok(()) => ok += 1,
                Err(_) => failed += 1,
            }
        }
        Ok(format!("updated {ok}, failed {failed}\n"))
    } else {
        update_one(&images_dir, target).await?;
        Ok(format!("image '{target}' updated\n"))
    }
}

async fn update_one(images_dir: &Path, name: &str) -> Result<()> {
    let rootfs = images_dir.join(name).join("rootfs");
    if rootfs.exists() {
        fs::remove_dir_all(&rootfs).map_err(PhiockerError::Io)?;
    }
    fs::create_dir_all(&rootfs).map_err(PhiockerError::Io)?;
    if let Some(url) = KNOWN_IMAGES.get(name) {
        let result = archive::fetch_and_extract(url, &rootfs, progress_reporter()).await;
        eprintln!();
        result
    } else {
        oci::pull(name, &rootfs).await
    }
}

/// `download` is a thin alias over ensuring the base image is present,
/// exposed as its own subcommand for a one-shot pre-fetch (§6).
pub async fn download(args: &[String], base_path: &Path) -> Result<String> {
    let name = args
        .first()
        .ok_or_else(|| PhiockerError::user("download requires an image name"))?;
    let rootfs = ensure_base_image(base_path, name).await?;
    let size = fsutil::directory_size(&rootfs).unwrap_or(0);
    Ok(format!("image '{name}' ready ({})\n", human_size(size)))
}

/// With no repo given, lists the built-in short names; with one, lists its
/// tags from the remote registry (§1, "a pure ... remote-registry listing").
pub async fn search(args: &[String]) -> Result<String> {
    let repo = match args.first() {
        Some(r) => r,
        None => {
            let mut out = String::new();
            for name in image::KNOWN_IMAGES.keys() {
                out.push_str(name);
                out.push('\n');
            }
            return Ok(out);
        }
    };

    let limit = args.get(1).and_then(|s| s.parse::<usize>().ok());
    let tags = oci::search(repo, limit).await?;
    if tags.is_empty() {
        return Ok(format!("no tags found for '{repo}'\n"));
    }
    Ok(tags.into_iter().map(|t| t + "\n").collect())
}
