//! Storage devices that can be offered as a recovery source.
//!
//! - Linux: whole disks and their partitions from `/sys/block`
//! - macOS: `/dev/diskN` and `/dev/diskNsM` nodes
//! - Windows: logical drives `A:` to `Z:`, opened as raw volumes
//!
//! Listing never fails as a whole. Entries that can't be read are logged
//! at debug level and left out.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{BlockSource, FileSource};

/// Sector unit used by the sysfs `size` attribute
const SYSFS_SECTOR: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Disk,
    Partition,
    /// Windows drive letter
    Volume,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Partition => "partition",
            DeviceKind::Volume => "volume",
        })
    }
}

/// A block device or volume that can be scanned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDevice {
    /// Path to pass as the recovery source
    pub path: PathBuf,
    pub name: String,
    pub kind: DeviceKind,
    /// Size in bytes, when it could be determined without privileges
    pub size: Option<u64>,
    pub removable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SourceDevice {
    /// One-line description for pickers
    pub fn label(&self) -> String {
        let size = self
            .size
            .map(|s| humansize::format_size(s, humansize::BINARY))
            .unwrap_or_else(|| "size unknown".to_string());
        let mut label = format!("{} ({}, {})", self.path.display(), self.kind, size);
        if let Some(model) = &self.model {
            label.push_str(&format!(" {model}"));
        }
        if self.removable {
            label.push_str(" [removable]");
        }
        label
    }
}

/// Devices on this machine, disks before their partitions
pub fn list_devices() -> Vec<SourceDevice> {
    #[cfg(target_os = "linux")]
    {
        block_devices_in(Path::new("/sys/block"), Path::new("/dev"))
    }

    #[cfg(target_os = "macos")]
    {
        disk_nodes_in(Path::new("/dev"))
    }

    #[cfg(windows)]
    {
        logical_drives()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Vec::new()
    }
}

/// Read a sysfs-style `block` directory. Device nodes are named after the
/// entries under `dev`.
///
/// RAM disks and devices reporting zero size (empty loop devices, card
/// readers without a card) are skipped.
pub fn block_devices_in(sys_block: &Path, dev: &Path) -> Vec<SourceDevice> {
    let mut devices = Vec::new();
    for name in sorted_names(sys_block) {
        if name.starts_with("ram") || name.starts_with("zram") {
            continue;
        }
        let entry = sys_block.join(&name);
        let Some(size) = sysfs_size(&entry) else {
            continue;
        };
        let removable = read_trimmed(&entry.join("removable")).as_deref() == Some("1");
        devices.push(SourceDevice {
            path: dev.join(&name),
            name: name.clone(),
            kind: DeviceKind::Disk,
            size: Some(size),
            removable,
            model: read_trimmed(&entry.join("device").join("model")).filter(|m| !m.is_empty()),
        });

        for part in sorted_names(&entry) {
            let part_dir = entry.join(&part);
            if !part_dir.join("partition").is_file() {
                continue;
            }
            let Some(size) = sysfs_size(&part_dir) else {
                continue;
            };
            devices.push(SourceDevice {
                path: dev.join(&part),
                name: part,
                kind: DeviceKind::Partition,
                size: Some(size),
                removable,
                model: None,
            });
        }
    }
    tracing::debug!(count = devices.len(), root = %sys_block.display(), "Listed block devices");
    devices
}

/// `diskN` and `diskNsM` nodes under `dev`, sized by seeking to their end
pub fn disk_nodes_in(dev: &Path) -> Vec<SourceDevice> {
    let mut devices: Vec<SourceDevice> = sorted_names(dev)
        .into_iter()
        .filter_map(|name| {
            let kind = disk_node_kind(&name)?;
            let path = dev.join(&name);
            Some(SourceDevice {
                size: seek_size(&path),
                path,
                name,
                kind,
                removable: false,
                model: None,
            })
        })
        .collect();
    // disk2 before disk10, each disk before its slices
    devices.sort_by_key(|d| disk_node_numbers(&d.name));
    devices
}

fn disk_node_kind(name: &str) -> Option<DeviceKind> {
    let rest = name.strip_prefix("disk")?;
    match rest.split_once('s') {
        None if is_number(rest) => Some(DeviceKind::Disk),
        Some((disk, slice)) if is_number(disk) && is_number(slice) => Some(DeviceKind::Partition),
        _ => None,
    }
}

fn disk_node_numbers(name: &str) -> (u64, u64) {
    let rest = name.trim_start_matches("disk");
    let (disk, slice) = rest.split_once('s').unwrap_or((rest, "0"));
    (disk.parse().unwrap_or(0), slice.parse().unwrap_or(0))
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Drive letters whose root exists, as raw volume paths (`\\.\C:`)
#[cfg(windows)]
fn logical_drives() -> Vec<SourceDevice> {
    (b'A'..=b'Z')
        .filter(|letter| Path::new(&format!("{}:\\", *letter as char)).exists())
        .map(|letter| {
            let name = format!("{}:", letter as char);
            let path = PathBuf::from(format!("\\\\.\\{name}"));
            SourceDevice {
                size: seek_size(&path),
                path,
                name,
                kind: DeviceKind::Volume,
                removable: false,
                model: None,
            }
        })
        .collect()
}

/// Size as the reader would see it; `None` without permission or for
/// devices that report zero
fn seek_size(path: &Path) -> Option<u64> {
    match FileSource::open(path) {
        Ok(source) => Some(source.size()).filter(|&s| s > 0),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Can't size device");
            None
        }
    }
}

fn sysfs_size(dir: &Path) -> Option<u64> {
    let sectors: u64 = read_trimmed(&dir.join("size"))?.parse().ok()?;
    Some(sectors * SYSFS_SECTOR).filter(|&s| s > 0)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn sorted_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Can't list devices");
            Vec::new()
        }
    };
    names.sort();
    names
}
