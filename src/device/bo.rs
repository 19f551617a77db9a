//! Buffer objects and the handle registry.
//!
//! A buffer object pairs a device region with optional host-side state:
//! a caller-owned pointer (userptr variant), a lazily created owned
//! mapping, or a file-backed shared mapping for exported and imported
//! buffers. The registry assigns handles monotonically and never reuses
//! one while the device is open.

use crate::error::{ShimError, ShimResult};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

/// Shareable identity of an exported buffer, valid across sessions on
/// the same host.
#[derive(Debug, Clone)]
pub struct ExportToken {
    pub path: PathBuf,
    pub size: u64,
}

/// A file-backed shared mapping owned by one exported buffer.
///
/// The mapping and its file are released exactly once, when the buffer
/// is freed or the device closes, whichever comes first.
pub struct ExportedMapping {
    path: PathBuf,
    addr: *mut libc::c_void,
    len: usize,
    // Held open so the fd outlives the mapping.
    _file: File,
}

impl ExportedMapping {
    /// Creates the backing file, sizes it, and maps it shared.
    ///
    /// The mapping is executable because some consumers load kernel
    /// stubs straight out of exported buffers.
    ///
    /// # Errors
    /// `Io` when the file cannot be created or the mapping fails.
    pub fn create(path: &Path, size: u64) -> ShimResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;

        let len = size as usize;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            path: path.to_path_buf(),
            addr,
            len,
            _file: file,
        })
    }

    /// Opens an existing export file from another session.
    ///
    /// # Errors
    /// `Io` when the file is absent or cannot be mapped.
    pub fn open(path: &Path, size: u64) -> ShimResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = size as usize;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            path: path.to_path_buf(),
            addr,
            len,
            _file: file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr.cast()
    }

    /// Mutable view of the mapped bytes.
    ///
    /// # Safety
    /// The caller must be the only active accessor of the mapping; all
    /// device-layer access happens under the device state lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.cast(), self.len) }
    }
}

impl Drop for ExportedMapping {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.addr, self.len) };
        if rc != 0 {
            log::warn!(
                "munmap of export {} failed: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
}

// The raw mapping address is only dereferenced under the device state
// lock, and the mapping is shared (file-backed) rather than thread-local.
unsafe impl Send for ExportedMapping {}

/// Host-side backing of one buffer object.
pub enum HostBacking {
    /// No host view yet; created lazily on first map or sync.
    None,
    /// Caller-owned pointer; never freed by the registry.
    User(*mut u8),
    /// Owned host memory, stable for the life of the buffer.
    Owned(Box<[u8]>),
    /// Shared file mapping of an exported buffer.
    Exported(ExportedMapping),
}

/// One registered buffer object.
pub struct BufferObject {
    pub size: u64,
    pub base: u64,
    pub bank: u32,
    pub no_host_memory: bool,
    pub host: HostBacking,
    /// Export file of the origin buffer, set only on imported handles.
    /// Copies targeting an imported buffer go to this file rather than
    /// the local device region.
    pub imported_from: Option<PathBuf>,
}

impl BufferObject {
    #[must_use]
    pub fn is_imported(&self) -> bool {
        self.imported_from.is_some()
    }

    /// Host view of the buffer, if one exists.
    ///
    /// # Safety
    /// For the userptr variant the caller-supplied pointer must still be
    /// valid for `size` bytes.
    pub unsafe fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.host {
            HostBacking::None => None,
            HostBacking::User(ptr) => {
                Some(unsafe { std::slice::from_raw_parts_mut(*ptr, self.size as usize) })
            }
            HostBacking::Owned(buf) => Some(buf),
            HostBacking::Exported(map) => Some(unsafe { map.bytes_mut() }),
        }
    }
}

// Raw host pointers are only dereferenced under the device state lock.
unsafe impl Send for BufferObject {}

/// Handle-to-record table for one device.
#[derive(Default)]
pub struct BoRegistry {
    next: u32,
    table: BTreeMap<u32, BufferObject>,
}

impl BoRegistry {
    /// Registers a buffer and returns its handle. Handles start at 1;
    /// zero is never a valid handle.
    pub fn insert(&mut self, bo: BufferObject) -> u32 {
        self.next += 1;
        self.table.insert(self.next, bo);
        self.next
    }

    /// # Errors
    /// `BadHandle` for a handle not in the table.
    pub fn get(&self, handle: u32) -> ShimResult<&BufferObject> {
        self.table.get(&handle).ok_or(ShimError::BadHandle(handle))
    }

    /// # Errors
    /// `BadHandle` for a handle not in the table.
    pub fn get_mut(&mut self, handle: u32) -> ShimResult<&mut BufferObject> {
        self.table
            .get_mut(&handle)
            .ok_or(ShimError::BadHandle(handle))
    }

    /// # Errors
    /// `BadHandle` for a handle not in the table; the table is untouched.
    pub fn remove(&mut self, handle: u32) -> ShimResult<BufferObject> {
        self.table
            .remove(&handle)
            .ok_or(ShimError::BadHandle(handle))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u32, BufferObject)> + '_ {
        std::mem::take(&mut self.table).into_iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_bo(base: u64, size: u64) -> BufferObject {
        BufferObject {
            size,
            base,
            bank: 0,
            no_host_memory: false,
            host: HostBacking::None,
            imported_from: None,
        }
    }

    #[test]
    fn handles_are_monotonic_and_never_reused() {
        let mut reg = BoRegistry::default();
        let a = reg.insert(plain_bo(0x1000, 4096));
        let b = reg.insert(plain_bo(0x2000, 4096));
        assert!(a > 0 && b > a);

        reg.remove(a).unwrap();
        let c = reg.insert(plain_bo(0x3000, 4096));
        assert!(c > b);
    }

    #[test]
    fn removing_an_unknown_handle_leaves_the_table_intact() {
        let mut reg = BoRegistry::default();
        let a = reg.insert(plain_bo(0x1000, 4096));
        assert!(matches!(reg.remove(999), Err(ShimError::BadHandle(999))));
        assert_eq!(reg.get(a).unwrap().base, 0x1000);
    }

    #[test]
    fn exported_mapping_round_trips_through_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bo1.export");

        let map = ExportedMapping::create(&path, 4096).unwrap();
        (unsafe { map.bytes_mut() })[..5].copy_from_slice(b"hello");
        drop(map);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 4096);
        assert_eq!(&contents[..5], b"hello");

        let reopened = ExportedMapping::open(&path, 4096).unwrap();
        assert_eq!(&unsafe { reopened.bytes_mut() }[..5], b"hello");
    }
}
