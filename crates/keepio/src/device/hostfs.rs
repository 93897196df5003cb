// SPDX-License-Identifier: Apache-2.0

//! Host filesystem proxy
//!
//! Every operation is forwarded to the host in one round trip on the filesystem arena.
//! Paths are relative to the host directory the device was mounted from.

use super::{Backend, DirEntry, Device};
use crate::link::{HostFd, HostLink};

use core::ffi::c_int;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libc::{mode_t, off_t, EBADF, ENOTDIR};
use postern::guest::call::fs;
use postern::item::fs::Stat;
use postern::item::Family;
use postern::{Result, NULL};
use spin::Mutex;
use tracing::debug;

/// Joins device-relative `path` onto the host directory `root`.
fn join(root: &str, path: &str) -> Vec<u8> {
    match (root, path) {
        ("/", path) => path.as_bytes().to_vec(),
        (root, "/") => root.as_bytes().to_vec(),
        (root, path) => [root.as_bytes(), path.as_bytes()].concat(),
    }
}

/// The host filesystem template and its mounted instances.
pub(crate) struct HostFs {
    link: Arc<HostLink>,
    root: Mutex<String>,
}

impl Clone for HostFs {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            root: Mutex::new(self.root.lock().clone()),
        }
    }
}

impl HostFs {
    pub fn new(link: Arc<HostLink>) -> Self {
        Self {
            link,
            root: Mutex::new("/".into()),
        }
    }

    pub fn unmounted(&self) -> Self {
        Self::new(self.link.clone())
    }

    fn host_path(&self, path: &str) -> Vec<u8> {
        join(&self.root.lock(), path)
    }

    pub fn open(&self, path: &str, flags: c_int, mode: mode_t) -> Result<Device> {
        let path = self.host_path(path);
        let fd = self.link.execute(fs::Open {
            path: &path,
            flags,
            mode,
        })?;
        let fd = HostFd::new(self.link.clone(), Family::Fs, fd);
        Ok(Device::new(Backend::HostFile(HostFile::new(fd))))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let path = self.host_path(path);
        self.link.execute(fs::StatPath { path: &path })
    }

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (self.host_path(old), self.host_path(new));
        self.link.execute(fs::Link {
            old: &old,
            new: &new,
        })
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = self.host_path(path);
        self.link.execute(fs::Unlink { path: &path })
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (self.host_path(old), self.host_path(new));
        self.link.execute(fs::Rename {
            old: &old,
            new: &new,
        })
    }

    pub fn truncate(&self, path: &str, length: off_t) -> Result<()> {
        let path = self.host_path(path);
        self.link.execute(fs::Truncate {
            path: &path,
            length,
        })
    }

    pub fn mkdir(&self, path: &str, mode: mode_t) -> Result<()> {
        let path = self.host_path(path);
        self.link.execute(fs::Mkdir { path: &path, mode })
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = self.host_path(path);
        self.link.execute(fs::Rmdir { path: &path })
    }

    pub fn opendir(&self, path: &str) -> Result<Device> {
        let path = self.host_path(path);
        let handle = self.link.execute(fs::Opendir { path: &path })?;
        let stream = Stream {
            link: self.link.clone(),
            handle: AtomicUsize::new(handle),
        };
        Ok(Device::new(Backend::HostDir(HostDir {
            stream: Arc::new(stream),
        })))
    }

    /// Roots the instance at host directory `source`.
    pub fn mount(&self, source: &str) -> Result<()> {
        let stat = self.link.execute(fs::StatPath {
            path: source.as_bytes(),
        })?;
        if !stat.is_dir() {
            return Err(ENOTDIR);
        }
        *self.root.lock() = source.into();
        Ok(())
    }

    pub fn unmount(&self) -> Result<()> {
        *self.root.lock() = "/".into();
        Ok(())
    }
}

/// An open host file.
#[derive(Clone, Debug)]
pub(crate) struct HostFile {
    fd: Arc<HostFd>,
}

impl HostFile {
    pub fn new(fd: HostFd) -> Self {
        Self { fd: Arc::new(fd) }
    }

    fn link(&self) -> &HostLink {
        self.fd.link()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd.get()?;
        self.link().execute(fs::Read { fd, buf })
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.fd.get()?;
        self.link().execute(fs::Write { fd, buf })
    }

    pub fn lseek(&self, offset: off_t, whence: c_int) -> Result<off_t> {
        let fd = self.fd.get()?;
        self.link().execute(fs::Lseek { fd, offset, whence })
    }

    pub fn fstat(&self) -> Result<Stat> {
        let fd = self.fd.get()?;
        self.link().execute(fs::Fstat { fd })
    }

    pub fn ftruncate(&self, length: off_t) -> Result<()> {
        let fd = self.fd.get()?;
        self.link().execute(fs::Ftruncate { fd, length })
    }

    pub fn close(&self) -> Result<()> {
        self.fd.close()
    }

    pub fn host_fd(&self) -> Result<c_int> {
        self.fd.get()
    }
}

/// A host directory stream, closed when dropped.
struct Stream {
    link: Arc<HostLink>,
    handle: AtomicUsize,
}

impl Stream {
    fn get(&self) -> Result<usize> {
        match self.handle.load(Ordering::Acquire) {
            NULL => Err(EBADF),
            handle => Ok(handle),
        }
    }

    fn close(&self) -> Result<()> {
        match self.handle.swap(NULL, Ordering::AcqRel) {
            NULL => Err(EBADF),
            handle => self.link.execute(fs::Closedir { handle }),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.handle.load(Ordering::Acquire) == NULL {
            return;
        }
        if let Err(err) = self.close() {
            debug!(err, "failed to close host directory stream");
        }
    }
}

/// An open host directory.
#[derive(Clone)]
pub(crate) struct HostDir {
    stream: Arc<Stream>,
}

impl HostDir {
    pub fn readdir(&self) -> Result<Option<DirEntry>> {
        let handle = self.stream.get()?;
        let dirent = self.stream.link.execute(fs::Readdir { handle })?;
        Ok(dirent.and_then(|dirent| {
            let name = dirent.name()?;
            Some(DirEntry {
                ino: dirent.ino,
                kind: dirent.kind as u8,
                name: String::from_utf8_lossy(name).into_owned(),
            })
        }))
    }

    pub fn closedir(&self) -> Result<()> {
        self.stream.close()
    }

    pub fn close(&self) -> Result<()> {
        self.stream.close()
    }
}
