//! Thin wrappers over the host OS primitives the pipelines depend on:
//! positioned IO, exclusive locks, cluster-size discovery, the sparse
//! attribute, hole punching, file sizing, flushing, and timestamps.
//!
//! The core engine is written against these functions alone; everything
//! platform-specific stays behind the cfg splits in this module.

use std::fs::File;
use std::io;
use std::path::Path;

use filetime::FileTime;

use crate::error::{Result, SparseError};

// ---------------------------------------------------------------------------
// Positioned reads and writes
// ---------------------------------------------------------------------------

/// Reads at `offset` until `buf` is full or EOF. Returns the byte count
/// actually read; the caller decides whether a short count is legal.
pub fn pread_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match pread(file, &mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Writes all of `buf` at `offset`.
pub fn pwrite_full(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut total = 0usize;
    while total < buf.len() {
        match pwrite(file, &buf[total..], offset + total as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                ))
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

// ---------------------------------------------------------------------------
// Exclusive access
// ---------------------------------------------------------------------------

/// Holds an exclusive lock for the duration of a run. Dropping the guard
/// releases the lock, so callers keep it alive until the file is closed.
///
/// On Unix the guard wraps `nix::fcntl::Flock` over a duplicated handle;
/// `flock(2)` locks the open file description, so the lock covers the
/// original handle and every clone of it. On Windows exclusivity is
/// established at open time through a zero share mode and the guard is
/// empty.
pub struct FileLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
}

/// Takes a non-blocking exclusive lock on `file`.
///
/// A lock held elsewhere surfaces as `AlreadyInUse`.
#[cfg(unix)]
pub fn lock_exclusive(file: &File, path: &Path) -> Result<FileLock> {
    use nix::fcntl::{Flock, FlockArg};

    let handle = file.try_clone().map_err(|e| SparseError::io_at(0, e))?;
    match Flock::lock(handle, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => Ok(FileLock { _guard: guard }),
        Err((_, errno)) => {
            // EWOULDBLOCK and EAGAIN are the same value where it matters.
            Err(if errno == nix::errno::Errno::EWOULDBLOCK {
                SparseError::AlreadyInUse(path.display().to_string())
            } else {
                SparseError::Io {
                    offset: 0,
                    source: io::Error::from(errno),
                }
            })
        }
    }
}

#[cfg(windows)]
pub fn lock_exclusive(_file: &File, _path: &Path) -> Result<FileLock> {
    Ok(FileLock {})
}

// ---------------------------------------------------------------------------
// Cluster-size discovery
// ---------------------------------------------------------------------------

/// Reports the allocation unit of the filesystem holding `file`, or 0 when
/// it cannot be determined. Callers substitute a default; discovery failure
/// is never fatal.
#[cfg(unix)]
pub fn query_cluster_size(file: &File) -> u64 {
    match nix::sys::statvfs::fstatvfs(file) {
        Ok(vfs) => {
            let frag = vfs.fragment_size() as u64;
            if frag > 0 {
                frag
            } else {
                vfs.block_size() as u64
            }
        }
        Err(_) => 0,
    }
}

#[cfg(windows)]
pub fn query_cluster_size(_file: &File) -> u64 {
    // Volume geometry queries need a separate volume handle; let the caller
    // fall back to the default cluster size.
    0
}

// ---------------------------------------------------------------------------
// Sparse attribute
// ---------------------------------------------------------------------------

/// Marks `file` as eligible for sparse allocation.
///
/// Regular files are natively sparse on Unix, so this succeeds without a
/// syscall. On Windows the attribute must be set explicitly before any
/// zero-range request.
#[cfg(unix)]
pub fn set_sparse(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
pub fn set_sparse(file: &File) -> Result<()> {
    use std::os::windows::io::AsRawHandle;

    let mut bytes_returned: winapi::shared::minwindef::DWORD = 0;
    // SAFETY: the handle is owned by `file` and outlives the call; no
    // input/output buffers are passed for FSCTL_SET_SPARSE.
    let ok = unsafe {
        winapi::um::ioapiset::DeviceIoControl(
            file.as_raw_handle() as winapi::um::winnt::HANDLE,
            winapi::um::winioctl::FSCTL_SET_SPARSE,
            std::ptr::null_mut(),
            0,
            std::ptr::null_mut(),
            0,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(SparseError::UnsupportedFilesystem);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Hole punching
// ---------------------------------------------------------------------------

/// Asks the filesystem to deallocate every cluster fully contained in
/// `[start, end)`. Reads of the range return zero afterwards; the logical
/// file size is unchanged.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, start: u64, end: u64) -> Result<()> {
    use nix::fcntl::{fallocate, FallocateFlags};

    let offset = i64::try_from(start)
        .map_err(|_| SparseError::InvalidArgument("zero range exceeds off_t"))?;
    let len = i64::try_from(end - start)
        .map_err(|_| SparseError::InvalidArgument("zero range exceeds off_t"))?;

    fallocate(
        file,
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        offset,
        len,
    )
    .map_err(|errno| match errno {
        nix::errno::Errno::EOPNOTSUPP => SparseError::UnsupportedFilesystem,
        errno => SparseError::Io {
            offset: start,
            source: io::Error::from(errno),
        },
    })
}

#[cfg(windows)]
pub fn punch_hole(file: &File, start: u64, end: u64) -> Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::winioctl::{FILE_ZERO_DATA_INFORMATION, FSCTL_SET_ZERO_DATA};

    let mut info: FILE_ZERO_DATA_INFORMATION = unsafe { std::mem::zeroed() };
    // SAFETY: LARGE_INTEGER union access on a zeroed local.
    unsafe {
        *info.FileOffset.QuadPart_mut() = start as i64;
        *info.BeyondFinalZero.QuadPart_mut() = end as i64;
    }

    let mut bytes_returned: winapi::shared::minwindef::DWORD = 0;
    // SAFETY: `info` lives across the synchronous call; the handle is owned
    // by `file`.
    let ok = unsafe {
        winapi::um::ioapiset::DeviceIoControl(
            file.as_raw_handle() as winapi::um::winnt::HANDLE,
            FSCTL_SET_ZERO_DATA,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<FILE_ZERO_DATA_INFORMATION>() as u32,
            std::ptr::null_mut(),
            0,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(SparseError::Io {
            offset: start,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn punch_hole(_file: &File, _start: u64, _end: u64) -> Result<()> {
    Err(SparseError::UnsupportedFilesystem)
}

// ---------------------------------------------------------------------------
// File size and flushing
// ---------------------------------------------------------------------------

/// Sets the logical file size (extending with a hole or truncating).
pub fn set_file_size(file: &File, size: u64) -> Result<()> {
    file.set_len(size).map_err(|e| SparseError::io_at(size, e))
}

/// Flushes file data and metadata to stable storage.
pub fn flush(file: &File) -> io::Result<()> {
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// The timestamp triple captured at open and restored on request. Creation
/// time is carried opaquely and only where the platform exposes it.
#[derive(Debug, Clone, Copy)]
pub struct FileStamps {
    pub created: Option<FileTime>,
    pub accessed: FileTime,
    pub modified: FileTime,
}

/// Reads the timestamp triple from `file`.
pub fn get_timestamps(file: &File) -> io::Result<FileStamps> {
    let meta = file.metadata()?;
    Ok(FileStamps {
        created: FileTime::from_creation_time(&meta),
        accessed: FileTime::from_last_access_time(&meta),
        modified: FileTime::from_last_modification_time(&meta),
    })
}

/// Applies access and modification times from `stamps` to `file`.
///
/// Creation time is not settable through a portable interface; the access
/// and modification pair is what the analyze `-p` flag and the copy drivers
/// preserve.
pub fn set_timestamps(file: &File, stamps: &FileStamps) -> io::Result<()> {
    filetime::set_file_handle_times(file, Some(stamps.accessed), Some(stamps.modified))
}
