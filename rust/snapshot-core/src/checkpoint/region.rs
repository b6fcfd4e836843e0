// rust/snapshot-core/src/checkpoint/region.rs

//! Shared-memory regions addressed by owning process and descriptor number.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Names a shared-memory region: descriptor `fd` held open by process `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub pid: u32,
    pub fd: i32,
}

impl RegionDescriptor {
    pub fn new(pid: u32, fd: i32) -> Self {
        Self { pid, fd }
    }

    /// Procfs path through which any process may open the region.
    pub fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/fd/{}", self.pid, self.fd))
    }
}

impl fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} fd {}", self.pid, self.fd)
    }
}

/// Resolves a region descriptor to the bytes it currently holds.
pub trait RegionLocator: Send + Sync {
    /// Copies a live region into owned memory.
    ///
    /// The returned bytes never change afterwards, even when the region is
    /// rewritten or shrunk by a later save.
    ///
    /// Returns `Ok(None)` when the region no longer resolves, for example
    /// because its owner exited or closed the descriptor.
    fn locate(&self, region: &RegionDescriptor) -> Result<Option<Bytes>>;
}

/// Locates regions through `/proc/<pid>/fd/<fd>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcRegionLocator;

impl RegionLocator for ProcRegionLocator {
    fn locate(&self, region: &RegionDescriptor) -> Result<Option<Bytes>> {
        let path = region.proc_path();
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(%region, error = %e, "shared-memory region does not resolve");
                return Ok(None);
            }
        };

        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(%region, error = %e, "failed to stat shared-memory region");
                return Ok(None);
            }
        };
        if len == 0 {
            return Ok(None);
        }

        // The authority resizes and rewrites a path's region on every re-save,
        // so loaded graphs must not alias it.
        let mut image = Vec::with_capacity(len as usize);
        match file.read_to_end(&mut image) {
            Ok(_) => Ok(Some(Bytes::from(image))),
            Err(e) => {
                tracing::warn!(%region, error = %e, "failed to read shared-memory region");
                Ok(None)
            }
        }
    }
}

/// Creates an anonymous shared-memory file of `size` bytes.
#[cfg(target_os = "linux")]
pub(crate) fn create_memfd(name: &str, size: u64) -> std::io::Result<File> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(name.replace('\0', "_"))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size)?;
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn create_memfd(_name: &str, _size: u64) -> std::io::Result<File> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "shared-memory regions require memfd_create",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_path() {
        let region = RegionDescriptor::new(4242, 17);
        assert_eq!(region.proc_path(), PathBuf::from("/proc/4242/fd/17"));
        assert_eq!(region.to_string(), "pid 4242 fd 17");
    }

    #[test]
    fn test_dead_region_does_not_resolve() {
        // Descriptor numbers this large are never handed out.
        let region = RegionDescriptor::new(std::process::id(), 1 << 30);
        assert!(ProcRegionLocator.locate(&region).unwrap().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_memfd_resolves() {
        use std::io::Write;
        use std::os::fd::AsRawFd;

        let mut file = create_memfd("region-test", 0).unwrap();
        file.write_all(b"snapshot").unwrap();

        let region = RegionDescriptor::new(std::process::id(), file.as_raw_fd());
        let bytes = ProcRegionLocator.locate(&region).unwrap().unwrap();
        assert_eq!(&bytes[..], b"snapshot");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_located_bytes_survive_region_reuse() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::fs::FileExt;

        let mut file = create_memfd("reused-region", 0).unwrap();
        file.write_all(&[1u8; 16 * 4096]).unwrap();
        let region = RegionDescriptor::new(std::process::id(), file.as_raw_fd());
        let before = ProcRegionLocator.locate(&region).unwrap().unwrap();

        file.set_len(4).unwrap();
        file.write_all_at(&[7u8; 4], 0).unwrap();

        assert_eq!(before.len(), 16 * 4096);
        assert!(before.iter().all(|&b| b == 1));
        let after = ProcRegionLocator.locate(&region).unwrap().unwrap();
        assert_eq!(&after[..], &[7u8; 4]);
    }
}
