//! # POSIX Shared-Memory Objects
//!
//! Named objects created with `shm_open`. The creator truncates the object
//! to the requested size; peers open it by name and learn the size with
//! `fstat`.

use crate::mmu::{Mapping, Protection};
use crate::{HalError, HalResult};
use alloc::ffi::CString;
use alloc::string::String;
use alloc::vec::Vec;

/// An open shared-memory object.
///
/// Dropping the object closes its descriptor. The name stays registered
/// until [`SharedMemoryObject::unlink`] is called.
#[derive(Debug)]
pub struct SharedMemoryObject {
    fd: libc::c_int,
    name: CString,
}

impl SharedMemoryObject {
    /// Create (or truncate and reuse) the object `name` with `size` bytes.
    ///
    /// On any failure after `shm_open` succeeded the descriptor is closed
    /// and the name unlinked again.
    pub fn create(name: &str, size: usize) -> HalResult<Self> {
        if size == 0 {
            return Err(HalError::InvalidParameter);
        }
        let cname = normalize_name(name)?;

        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd == -1 {
            let err = HalError::last_os_error();
            log::error!("shm_open({:?}, O_RDWR|O_CREAT|O_TRUNC) failed: {}", cname, err);
            return Err(err);
        }

        let object = Self { fd, name: cname };

        // SAFETY: fd is open for writing.
        if unsafe { libc::ftruncate(object.fd, size as libc::off_t) } == -1 {
            let err = HalError::last_os_error();
            log::error!("ftruncate({:?}, {}) failed: {}", object.name, size, err);
            let _ = object.unlink();
            return Err(err);
        }

        Ok(object)
    }

    /// Open the existing object `name`.
    pub fn open(name: &str) -> HalResult<Self> {
        let cname = normalize_name(name)?;

        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd == -1 {
            let err = HalError::last_os_error();
            log::error!("shm_open({:?}, O_RDWR) failed: {}", cname, err);
            return Err(err);
        }

        Ok(Self { fd, name: cname })
    }

    /// Current size of the object in bytes.
    pub fn size(&self) -> HalResult<usize> {
        let mut stat = core::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: stat points to writable storage of the right type.
        if unsafe { libc::fstat(self.fd, stat.as_mut_ptr()) } == -1 {
            let err = HalError::last_os_error();
            log::error!("fstat(#{}) failed: {}", self.fd, err);
            return Err(err);
        }
        // SAFETY: fstat succeeded and filled the struct.
        let stat = unsafe { stat.assume_init() };
        usize::try_from(stat.st_size).map_err(|_| HalError::InvalidParameter)
    }

    /// Map the first `len` bytes of the object.
    pub fn map(&self, len: usize) -> HalResult<Mapping> {
        Mapping::from_fd(self.fd, len, Protection::data())
    }

    /// The normalized name (always starts with `/`).
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    /// Remove the name; existing mappings stay valid.
    pub fn unlink(&self) -> HalResult<()> {
        unlink_cstr(&self.name)
    }

    /// Remove the object `name` without opening it.
    pub fn unlink_name(name: &str) -> HalResult<()> {
        unlink_cstr(&normalize_name(name)?)
    }
}

impl Drop for SharedMemoryObject {
    fn drop(&mut self) {
        // SAFETY: fd was returned by shm_open and is closed exactly once.
        if unsafe { libc::close(self.fd) } == -1 {
            log::error!("close(#{}) failed: {}", self.fd, HalError::last_os_error());
        }
    }
}

fn unlink_cstr(name: &CString) -> HalResult<()> {
    // SAFETY: name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        let err = HalError::last_os_error();
        log::error!("shm_unlink({:?}) failed: {}", name, err);
        return Err(err);
    }
    Ok(())
}

/// Portable object names are a single path component with a leading slash.
fn normalize_name(name: &str) -> HalResult<CString> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(HalError::InvalidParameter);
    }

    let mut full = String::with_capacity(trimmed.len() + 1);
    full.push('/');
    full.push_str(trimmed);

    let bytes: Vec<u8> = full.into_bytes();
    CString::new(bytes).map_err(|_| HalError::InvalidParameter)
}
