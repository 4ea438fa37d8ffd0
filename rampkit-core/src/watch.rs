//! Lifetime of a package after it has been handed to the consuming program.
//!
//! The consumer opens the package and keeps it locked while it works. A
//! [`PackageWatch`] polls the lock on a fixed schedule and deletes the package
//! once the consumer lets go, so the package outlives the pipeline call that
//! made it without being leaked. Cancelling the job's [`CancelToken`] ends the
//! watch and leaves the package in place.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{fs, io};

use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::{PackageError, PackageResult};
use crate::package::CancelToken;
use crate::platform;
use crate::retry::RetryPolicy;
use crate::robust_io;

/// Longest the watch sleeps before looking at its cancel token again.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Background timer that deletes a package once it is no longer locked.
///
/// Dropping the watch, or cancelling its token, stops the timer without
/// deleting anything.
#[derive(Debug)]
pub struct PackageWatch {
    path: PathBuf,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl PackageWatch {
    /// Starts watching `package` until it is released or `cancel` is cancelled.
    pub fn start(
        package: &Path,
        config: WatchConfig,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> PackageResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let path = package.to_path_buf();
        let worker_path = path.clone();

        let handle = thread::Builder::new()
            .name("rampkit-watch".to_string())
            .spawn(move || {
                let mut wait = config.initial_delay;
                loop {
                    if !pause(&stop_rx, &cancel, wait) {
                        debug!(package = %worker_path.display(), "package watch stopped");
                        return false;
                    }
                    if check_and_delete(&worker_path, &retry) {
                        return true;
                    }
                    wait = config.interval;
                }
            })
            .map_err(|_| PackageError::Worker {
                reason: "could not spawn package watch thread",
            })?;

        debug!(package = %path.display(), ?config, "package watch started");
        Ok(Self {
            path,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the watch has ended, either by deleting the package or by being stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the timer. The package is left in place.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Blocks until the package has been deleted. Returns `false` if the watch
    /// ended some other way.
    pub fn wait(mut self) -> bool {
        self.handle
            .take()
            .map(|h| h.join().unwrap_or(false))
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PackageWatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps for `wait`. Returns `false` as soon as the watch is stopped or
/// cancelled.
fn pause(stop: &Receiver<()>, cancel: &CancelToken, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        match stop.recv_timeout((deadline - now).min(CANCEL_POLL)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// One poll: returns `true` when the watch is done.
fn check_and_delete(package: &Path, retry: &RetryPolicy) -> bool {
    match platform::is_file_locked(package) {
        Ok(true) => false,
        Ok(false) => {
            match robust_io::delete_file(package, retry) {
                Ok(()) => info!(package = %package.display(), "package released; deleted"),
                Err(e) => warn!(package = %package.display(), error = %e, "could not delete released package"),
            }
            true
        }
        Err(e) => {
            warn!(package = %package.display(), error = %e, "could not check package lock");
            false
        }
    }
}

/// Deletes packages left behind in `dir` by earlier runs.
///
/// Meant to be called once when the owning application starts. Each removal
/// is retried under `retry`; files that still cannot be deleted are logged and
/// skipped. Returns the removed paths.
pub fn sweep_orphaned_packages(
    dir: &Path,
    extension: &str,
    retry: &RetryPolicy,
) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)?.filter_map(Result::ok) {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if !matches || !path.is_file() {
            continue;
        }
        match robust_io::delete_file(&path, retry) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(package = %path.display(), error = %e, "could not remove orphaned package"),
        }
    }
    Ok(removed)
}
