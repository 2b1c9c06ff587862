// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The raw shared region backing a sync ring or SHM-op ring: a POSIX
//! shared memory segment obtained from a `GET_SHARED_BUFFER` control call
//! and attached by every variant.

use crate::error::{AgentError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped shared memory region. Unmapped on drop; never unlinked
/// automatically (the monitor owns the segment's lifetime — see
/// `FLUSH_SHARED_BUFFER`).
pub struct BufferSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the region is `MAP_SHARED` and every access into it goes through
// atomics or the spinlock-guarded protocols documented at each call site.
unsafe impl Send for BufferSegment {}
unsafe impl Sync for BufferSegment {}

impl BufferSegment {
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') || name[1..].contains('/') {
            return Err(AgentError::Configuration(format!(
                "invalid shared buffer name: {name}"
            )));
        }
        Ok(())
    }

    /// Create (or replace) the named segment and zero-fill it.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| AgentError::Configuration(format!("invalid buffer name: {name}")))?;

        // SAFETY: c_name is NUL-terminated; O_CREAT|O_RDWR|O_EXCL either
        // creates the segment or fails, both handled below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(AgentError::Configuration(format!(
                "shm_open({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is a valid, just-opened descriptor.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(AgentError::Configuration(format!(
                "ftruncate({name}, {size}) failed: {err}"
            )));
        }

        // SAFETY: fd is sized and valid; MAP_SHARED makes this visible to
        // every other variant attaching the same segment name.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(AgentError::Configuration(format!(
                "mmap({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        // SAFETY: freshly mapped, exclusively owned at this point.
        unsafe { ptr::write_bytes(ptr as *mut u8, 0, size) };

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Attach an existing segment (a follower joining a buffer the leader
    /// or the monitor already created).
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| AgentError::Configuration(format!("invalid buffer name: {name}")))?;

        // SAFETY: c_name is NUL-terminated.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(AgentError::Configuration(format!(
                "shm_open({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is valid; size is the caller-known buffer geometry.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(AgentError::Configuration(format!(
                "mmap({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.clone()) {
            // SAFETY: unlinking a name that may already be gone is safe;
            // the call simply fails and is ignored, matching shm_unlink's
            // documented idempotence.
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }
}

impl Drop for BufferSegment {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size are exactly what `mmap` returned/was given.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_share_bytes() {
        let name = "/mvee_agent_test_segment_a";
        let writer = BufferSegment::create(name, 4096).unwrap();
        unsafe {
            *writer.as_ptr() = 0x42;
        }
        let reader = BufferSegment::open(name, 4096).unwrap();
        unsafe {
            assert_eq!(*reader.as_ptr(), 0x42);
        }
        writer.unlink();
    }

    #[test]
    fn invalid_name_is_rejected() {
        assert!(BufferSegment::create("no-leading-slash", 64).is_err());
        assert!(BufferSegment::create("/a/b", 64).is_err());
    }
}
