//! The core, UI-agnostic library for the `rampkit` archive packager.
//!
//! `rampkit-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `rampkit`) or a graphical application. It
//! takes grouped input files (the session's own files plus any contributor
//! files), writes a METS descriptor for them, and bundles everything into one
//! uncompressed archive package for a downstream archiving tool.
//!
//! The library is structured into several key modules:
//! - [`retry`] and [`robust_io`]: filesystem calls that ride out brief locks
//!   held by anti-virus scanners and indexers, built on [`platform`]'s
//!   lock classification.
//! - [`files`], [`normalize`] and [`content`]: the input model, archive-safe
//!   file names, and content-type classification.
//! - [`metadata`] and [`archive`]: the METS descriptor and the container writer.
//! - [`package`]: the cancellable, progress-reporting pipeline.
//! - [`watch`]: what happens to a package after it has been handed off.
//!
//! The primary entry point is [`package::Packager`]. Jobs run on a worker thread
//! and report through a channel of [`package::PackageEvent`]s, allowing the
//! calling application to display progress in any way it chooses.
//!
//! ## Example: Packaging a Session with Progress Reporting
//!
//! ```rust,no_run
//! use rampkit_core::files::FileLists;
//! use rampkit_core::package::{CancelToken, PackageEvent, Packager};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let packager = Packager::builder("Morning story", "session-001")
//!         .file_description(|group, _file| {
//!             if group.is_empty() { "Session file".into() } else { format!("Contributor file: {group}") }
//!         })
//!         .build()?;
//!
//!     let mut files = FileLists::new();
//!     files.add("", "recordings/story.wav").add("", "notes/story.txt");
//!     files.add("Contributor1", "video/interview.mp4");
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let cancel = CancelToken::new();
//!
//!     let outcome = packager.create_package(files, cancel, |event| match event {
//!         PackageEvent::Progress { message, completed, total } => {
//!             println!("[{completed}/{total}] {message}");
//!         }
//!         PackageEvent::Error { message, error } => eprintln!("{message} ({error})"),
//!         _ => {}
//!     })?;
//!
//!     if let Some(path) = outcome.package_path() {
//!         println!("Package ready at {}", path.display());
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod content;
pub mod error;
pub mod files;
pub mod metadata;
pub mod normalize;
pub mod package;
pub mod platform;
pub mod retry;
pub mod robust_io;
pub mod watch;

pub use error::{PackageError, PackageResult};
