//! Named POSIX shared memory segments mapped read-write.
//!
//! A segment is an `shm_open` object (`/dev/shm/<name>` on Linux) mapped with
//! `MAP_SHARED`, so every process that opens the same name sees the same
//! bytes, each at its own base address.

use memmap2::MmapMut;
use std::{
    ffi::CString,
    fs::File,
    io,
    os::fd::{FromRawFd, OwnedFd},
};

pub struct ShmSegment {
    name: String,
    _file: File,
    mmap: MmapMut,
}

impl ShmSegment {
    /// Create a new shared memory object of `size_bytes` and map it read-write.
    ///
    /// Fails with `AlreadyExists` if an object with this name is present. On
    /// any failure after the object was created it is unlinked again.
    pub fn create(name: &str, size_bytes: usize) -> io::Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: shm_open returned a fresh descriptor we now own
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let mut guard = UnlinkGuard::new(name);
        file.set_len(size_bytes as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        guard.disarm();

        tracing::debug!(name, size_bytes, "shm segment created");
        Ok(Self {
            name: name.to_owned(),
            _file: file,
            mmap,
        })
    }

    /// Open an existing shared memory object and map all of it read-write.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: shm_open returned a fresh descriptor we now own
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        tracing::debug!(name, len = mmap.len(), "shm segment opened");
        Ok(Self {
            name: name.to_owned(),
            _file: file,
            mmap,
        })
    }

    /// Remove the name. Existing mappings stay valid until they are dropped.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = shm_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Whether an object with this name currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = shm_name(name) else {
            return false;
        };
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            return false;
        }
        // SAFETY: closing the descriptor we just opened
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
        true
    }

    /// Return raw pointer to start of the mapped segment
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Unlinks a shared memory name on drop unless disarmed.
///
/// Used to roll back a half-built segment on every early return.
pub struct UnlinkGuard<'a> {
    name: &'a str,
    armed: bool,
}

impl<'a> UnlinkGuard<'a> {
    pub fn new(name: &'a str) -> Self {
        Self { name, armed: true }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UnlinkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = ShmSegment::unlink(self.name) {
                tracing::warn!(name = self.name, error = %e, "rollback unlink failed");
            }
        }
    }
}

/// Builds the `/name` form `shm_open` expects. A single leading `/` in the
/// input is accepted; any other `/` or NUL byte is rejected.
fn shm_name(name: &str) -> io::Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid shared memory name '{name}'"),
        ));
    }
    CString::new(format!("/{bare}")).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("basalt_mmap_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique("share");
        let mut a = ShmSegment::create(&name, 4096).unwrap();
        let mut b = ShmSegment::open(&name).unwrap();
        assert_eq!(b.len(), 4096);

        unsafe { a.as_mut_ptr().add(100).write(0xAB) };
        assert_eq!(unsafe { b.as_mut_ptr().add(100).read() }, 0xAB);

        ShmSegment::unlink(&name).unwrap();
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique("excl");
        let _first = ShmSegment::create(&name, 64).unwrap();
        let err = ShmSegment::create(&name, 64).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        ShmSegment::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_fails() {
        let err = ShmSegment::open(&unique("missing")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn names_are_normalised() {
        assert_eq!(shm_name("pool").unwrap().to_str().unwrap(), "/pool");
        assert_eq!(shm_name("/pool").unwrap().to_str().unwrap(), "/pool");
        assert!(shm_name("a/b").is_err());
        assert!(shm_name("/").is_err());
        assert!(shm_name("nul\0").is_err());
    }
}
