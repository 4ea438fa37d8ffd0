//! Settings shared by every packaging job.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Buffer used for the staged file copy.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;
/// Extension given to finished packages.
pub const DEFAULT_PACKAGE_EXTENSION: &str = "ramp";
/// Name of the descriptor file inside the package.
pub const METADATA_FILE_NAME: &str = "mets.xml";

/// Timing for the post-hand-off package watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// Wait before the first lock check.
    pub initial_delay: Duration,
    /// Wait between later checks.
    pub interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            interval: Duration::from_secs(4),
        }
    }
}

/// Configuration for a [`crate::package::Packager`].
#[derive(Clone, Debug)]
pub struct PackagerConfig {
    /// Directory under which each job creates its randomly named staging directory.
    pub staging_root: PathBuf,
    /// Directory the finished package is written to.
    pub output_dir: PathBuf,
    /// Extension of the package file, without the dot.
    pub package_extension: String,
    /// Size of the buffer used to copy each input file.
    pub copy_buffer_size: usize,
    /// Retry policy for every filesystem call the pipeline makes.
    pub retry: RetryPolicy,
    /// Timing for [`crate::watch::PackageWatch`].
    pub watch: WatchConfig,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        let temp = std::env::temp_dir();
        Self {
            staging_root: temp.clone(),
            output_dir: temp,
            package_extension: DEFAULT_PACKAGE_EXTENSION.to_string(),
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            retry: RetryPolicy::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl PackagerConfig {
    /// Where the package for `id` is written.
    pub fn package_path(&self, id: &str) -> PathBuf {
        self.output_dir
            .join(format!("{id}.{}", self.package_extension))
    }
}
