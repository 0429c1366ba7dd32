//! Image/rootfs utilities (C9, §4.8): pulling OCI images, fetching and
//! extracting raw rootfs archives, and cloning directory trees.

pub mod archive;
pub mod fsutil;
pub mod oci;

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Built-in short-name → archive URL mapping (§6).
pub static KNOWN_IMAGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "alpine",
        "https://dl-cdn.alpinelinux.org/alpine/latest-stable/releases/x86_64/alpine-minirootfs-3.23.3-x86_64.tar.gz",
    );
    m.insert(
        "ubuntu",
        "https://cloud-images.ubuntu.com/minimal/releases/focal/release/ubuntu-20.04-minimal-cloudimg-amd64-root.tar.xz",
    );
    m.insert(
        "arch",
        "https://mirror.rackspace.com/archlinux/iso/2026.01.01/archlinux-bootstrap-x86_64.tar.zst",
    );
    m
});
