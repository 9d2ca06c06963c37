//! Host device discovery for device passthrough.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor};
use serde_json::{Value, json};
use tracing::debug;

/// A character or block device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: PathBuf,
    pub kind: DeviceKind,
    pub major: u64,
    pub minor: u64,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    fn code(self) -> &'static str {
        match self {
            DeviceKind::Char => "c",
            DeviceKind::Block => "b",
        }
    }
}

impl Device {
    /// Entry for the OCI spec's `linux.devices` list.
    pub fn to_value(&self) -> Value {
        json!({
            "path": self.path.to_string_lossy(),
            "type": self.kind.code(),
            "major": self.major,
            "minor": self.minor,
            "fileMode": self.file_mode,
            "uid": self.uid,
            "gid": self.gid,
        })
    }

    /// Cgroup rule granting full access to this device.
    pub fn allow_rule(&self) -> Value {
        json!({
            "allow": true,
            "type": self.kind.code(),
            "major": self.major,
            "minor": self.minor,
            "access": "rwm",
        })
    }
}

/// Every device node under `root`, recursively, in path order.
///
/// Unreadable entries and the pseudo-terminal directory are skipped; device
/// passthrough is best effort.
pub fn scan(root: &Path) -> Vec<Device> {
    let mut devices = Vec::new();
    walk(root, &mut devices);
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

fn walk(dir: &Path, devices: &mut Vec<Device>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "skipping unreadable device directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if entry.file_name() == "pts" || entry.file_name() == "shm" {
                continue;
            }
            walk(&path, devices);
            continue;
        }
        let kind = if file_type.is_char_device() {
            DeviceKind::Char
        } else if file_type.is_block_device() {
            DeviceKind::Block
        } else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let rdev = meta.rdev();
        devices.push(Device {
            path,
            kind,
            major: major(rdev),
            minor: minor(rdev),
            file_mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        });
    }
}
