// SPDX-License-Identifier: Apache-2.0

//! Mount table and path resolution

use crate::device::Device;
use crate::table::DevId;

use std::sync::Arc;

use bitflags::bitflags;
use libc::{EEXIST, EINVAL, ENAMETOOLONG, ENOENT};
use postern::item::fs::PATH_MAX;
use postern::Result;
use spin::Mutex;
use tracing::debug;

bitflags! {
    /// Mount flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Refuse mutating operations with `EROFS`
        const RDONLY = 1;
    }
}

/// Normalizes an absolute path lexically.
///
/// Collapses repeated separators, drops `.` segments and resolves `..` segments, which never
/// climb above `/`. Fails with [`EINVAL`] for relative or empty paths and with
/// [`ENAMETOOLONG`] for paths of [`PATH_MAX`] bytes or more.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(EINVAL);
    }
    if path.len() >= PATH_MAX {
        return Err(ENAMETOOLONG);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return Ok("/".into());
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    Ok(normalized)
}

/// Splits a normalized path into its parent and final segment.
///
/// The root has no final segment and is its own parent.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

/// Returns whether `path` equals `prefix` or continues it at a `/`.
fn covers(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A mounted device
#[derive(Clone, Debug)]
pub struct Mount {
    pub path: String,
    pub id: DevId,
    pub device: Arc<Device>,
    pub flags: MountFlags,
}

/// A path resolved to the device mounted over it
#[derive(Clone, Debug)]
pub struct Resolved {
    pub device: Arc<Device>,
    pub flags: MountFlags,
    /// The path relative to the mount point, never empty
    pub suffix: String,
}

/// Ordered list of mounts.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Mutex<Vec<Mount>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves normalized `path` to the mount with the longest matching prefix.
    ///
    /// Fails with [`ENOENT`] if no mount covers `path`.
    pub fn resolve(&self, path: &str) -> Result<Resolved> {
        let mounts = self.mounts.lock();
        let mount = mounts
            .iter()
            .filter(|m| covers(&m.path, path))
            .max_by_key(|m| m.path.len())
            .ok_or(ENOENT)?;

        let suffix = match mount.path.as_str() {
            "/" => path,
            prefix => &path[prefix.len()..],
        };
        Ok(Resolved {
            device: mount.device.clone(),
            flags: mount.flags,
            suffix: if suffix.is_empty() { "/" } else { suffix }.into(),
        })
    }

    /// Adds a mount at normalized `path`, [`EEXIST`] if `path` is already a mount point.
    pub fn insert(&self, mount: Mount) -> Result<()> {
        let mut mounts = self.mounts.lock();
        if mounts.iter().any(|m| m.path == mount.path) {
            return Err(EEXIST);
        }
        debug!(path = %mount.path, id = mount.id, flags = ?mount.flags, "mount");
        mounts.push(mount);
        Ok(())
    }

    /// Returns the mount at exactly `path`.
    pub fn get(&self, path: &str) -> Option<Mount> {
        let mounts = self.mounts.lock();
        mounts.iter().find(|m| m.path == path).cloned()
    }

    /// Removes the mount at exactly `path`, [`ENOENT`] if there is none.
    pub fn remove(&self, path: &str) -> Result<Mount> {
        let mut mounts = self.mounts.lock();
        let index = mounts.iter().position(|m| m.path == path).ok_or(ENOENT)?;
        let mount = mounts.remove(index);
        debug!(path, id = mount.id, "unmount");
        Ok(mount)
    }

    /// Returns whether any mount lies strictly below `path`.
    pub fn has_children(&self, path: &str) -> bool {
        let mounts = self.mounts.lock();
        mounts.iter().any(|m| m.path != path && covers(path, &m.path))
    }

    /// Returns the mount points in mount order.
    pub fn paths(&self) -> Vec<String> {
        let mounts = self.mounts.lock();
        mounts.iter().map(|m| m.path.clone()).collect()
    }

    /// Removes every mount, most recent first.
    pub fn drain(&self) -> Vec<Mount> {
        let mut mounts = self.mounts.lock();
        let mut drained: Vec<Mount> = mounts.drain(..).collect();
        drained.reverse();
        drained
    }
}
