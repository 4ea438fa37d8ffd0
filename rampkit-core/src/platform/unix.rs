use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Returns `true` when `err` means the target is busy because some other
/// holder is using it.
///
/// On Unix this covers `EBUSY` (mount points, busy devices), `ETXTBSY` (a
/// running executable) and `EAGAIN`/`EWOULDBLOCK` (a conflicting lock).
pub fn is_lock_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ResourceBusy || err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EBUSY
            || code == libc::ETXTBSY
            || code == libc::EAGAIN
            || code == libc::EWOULDBLOCK
    )
}

/// Checks whether another holder has an exclusive lock on `path`.
///
/// The check takes a non-blocking `flock` on a fresh descriptor and releases it
/// immediately. A file that does not exist is not locked.
pub fn is_file_locked(path: &Path) -> io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        // SAFETY: as above; the lock is dropped with the descriptor anyway.
        unsafe { libc::flock(fd, libc::LOCK_UN) };
        return Ok(false);
    }

    let err = io::Error::last_os_error();
    if is_lock_contention(&err) {
        Ok(true)
    } else {
        Err(err)
    }
}
