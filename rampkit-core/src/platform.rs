//! Provides platform-specific functionality.
//!
//! This module answers two questions that the operating system phrases
//! differently on each platform: whether an I/O failure was caused by another
//! process holding the file (and is therefore worth retrying), and whether a
//! file is currently held open exclusively by someone else.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS. Each submodule exposes the same public API, so that the rest
//! of the library can use it without worrying about the underlying platform.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;
