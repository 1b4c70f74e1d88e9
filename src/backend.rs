// SPDX-License-Identifier: BSD-3-Clause

//! The I/O backend capability set the engine calls for all byte-level file
//! operations. The core never touches OS primitives directly; it only ever
//! goes through a [`Backend`] implementation.
//!
//! [`PosixBackend`] is the one implementation this crate ships, built the
//! same way the teacher wraps raw syscalls in its own `oslib`: a thin safe
//! wrapper per libc call, checking the return value against `-1` and
//! surfacing `errno` as `Error::Io` unchanged.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{Error, ResultErrorContext, Result};

/// How a path should be opened. Shared between the backend's own `open()`
/// and the image-level `open()` in [`crate::context`] — both describe "read
/// vs. write intent", just at different layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    ReadWriteCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

/// Byte-level file operations consumed by the engine. A missing `malloc`/
/// `free` pair compared to the reference vtable is intentional: buffers here
/// are plain `Vec<u8>`/`Box<[u8]>` values that already own their memory and
/// drop deterministically, so there is no separate allocator indirection to
/// thread through (see DESIGN.md).
pub trait Backend {
    type Handle;

    /// Opens `path` in the given mode.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the underlying open fails.
    fn open(&self, path: &str, mode: OpenMode) -> Result<Self::Handle>;

    /// Releases the handle. Never called twice on the same handle.
    fn close(&self, handle: Self::Handle) -> Result<()>;

    /// Repositions the handle, returning the resulting absolute offset.
    fn seek(&self, handle: &mut Self::Handle, offset: i64, whence: SeekWhence) -> Result<u64>;

    /// Fills `buf` completely. A short read is an error, not a partial fill.
    fn read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf`. A short write is an error.
    fn write(&self, handle: &mut Self::Handle, buf: &[u8]) -> Result<()>;

    /// Current size of the underlying file, in bytes.
    fn file_size(&self, handle: &Self::Handle) -> Result<u64>;
}

/// Checks a libc return value, turning a `-1` sentinel into the current
/// `errno`. Mirrors `oslib::check_retval` in shape; kept local since this
/// is the only module in this crate that talks to raw syscalls.
fn check_retval<T: From<i8> + PartialEq>(ret: T) -> std::io::Result<T> {
    if ret == T::from(-1_i8) {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Default backend: POSIX files addressed by raw file descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixBackend;

/// An open file descriptor. `close()` is the sole release path (spec.md
/// §5) — this type deliberately has no `Drop` impl, so a handle dropped
/// without going through [`Backend::close`] leaks the fd rather than
/// risking a double-close race with one that already went through it.
#[derive(Debug)]
pub struct PosixHandle(RawFd);

impl Backend for PosixBackend {
    type Handle = PosixHandle;

    fn open(&self, path: &str, mode: OpenMode) -> Result<PosixHandle> {
        let cpath = CString::new(path)
            .map_err(|_| Error::InvalidArgument(format!("path contains an interior NUL: {path}")))?;
        let flags = match mode {
            OpenMode::ReadOnly => libc::O_RDONLY,
            OpenMode::WriteOnly => libc::O_WRONLY,
            OpenMode::ReadWrite => libc::O_RDWR,
            OpenMode::ReadWriteCreate => libc::O_RDWR | libc::O_CREAT,
        };
        // SAFETY: `cpath` is a valid NUL-terminated string for the lifetime
        // of this call.
        let fd = check_retval(unsafe { libc::open(cpath.as_ptr(), flags, 0o600) })
            .map_err(Error::from)
            .err_context(|| format!("opening {path}"))?;
        Ok(PosixHandle(fd))
    }

    fn close(&self, handle: PosixHandle) -> Result<()> {
        // SAFETY: `handle.0` is an open fd owned by this `PosixHandle`,
        // passed by value so it cannot be used again after this call.
        check_retval(unsafe { libc::close(handle.0) }).map_err(Error::from)?;
        Ok(())
    }

    fn seek(&self, handle: &mut PosixHandle, offset: i64, whence: SeekWhence) -> Result<u64> {
        let whence = match whence {
            SeekWhence::Start => libc::SEEK_SET,
            SeekWhence::Current => libc::SEEK_CUR,
            SeekWhence::End => libc::SEEK_END,
        };
        // SAFETY: `handle.0` is a valid, open fd.
        let pos = check_retval(unsafe { libc::lseek(handle.0, offset, whence) }).map_err(Error::from)?;
        Ok(pos as u64)
    }

    fn read(&self, handle: &mut PosixHandle, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            // SAFETY: the pointer range `[filled, buf.len())` stays within
            // `buf`'s allocation, and `handle.0` is a valid, open fd.
            let n = check_retval(unsafe {
                libc::read(
                    handle.0,
                    buf[filled..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - filled,
                )
            })
            .map_err(Error::from)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read: hit EOF before filling the buffer",
                )));
            }
            filled += n as usize;
        }
        Ok(())
    }

    fn write(&self, handle: &mut PosixHandle, buf: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < buf.len() {
            // SAFETY: the pointer range `[written, buf.len())` stays within
            // `buf`'s allocation, and `handle.0` is a valid, open fd.
            let n = check_retval(unsafe {
                libc::write(
                    handle.0,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            })
            .map_err(Error::from)?;
            written += n as usize;
        }
        Ok(())
    }

    fn file_size(&self, handle: &PosixHandle) -> Result<u64> {
        // SAFETY: an all-zero byte pattern is a valid `libc::stat`, and
        // `handle.0` is a valid, open fd.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        check_retval(unsafe { libc::fstat(handle.0, &mut stat) }).map_err(Error::from)?;
        Ok(stat.st_size as u64)
    }
}
