use std::fs::OpenOptions;
use std::io;
use std::os::windows::fs::OpenOptionsExt;
use std::path::Path;
use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION};

/// Returns `true` when `err` means the target is in use by another process.
///
/// On Windows this is the sharing or lock violation that anti-virus scanners and
/// indexers cause while they hold a file open.
pub fn is_lock_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ResourceBusy {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == ERROR_SHARING_VIOLATION as i32 || code == ERROR_LOCK_VIOLATION as i32
    )
}

/// Checks whether another process holds `path` open in a way that prevents
/// exclusive access. A file that does not exist is not locked.
pub fn is_file_locked(path: &Path) -> io::Result<bool> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
    {
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) if is_lock_contention(&e) => Ok(true),
        Err(e) => Err(e),
    }
}
