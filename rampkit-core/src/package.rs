//! The packaging pipeline.
//!
//! A [`Packager`] turns grouped input files into a METS descriptor plus a single
//! uncompressed archive. Each call to [`Packager::start`] creates one job that
//! runs on its own worker thread and moves through these states:
//!
//! ```text
//! Idle -> BuildingMetadata -> StagingFiles -> WritingPackage -> Done
//!              \___________________\_______________\______-> Cancelled
//!  any non-terminal state ---------------------------------> Failed
//! ```
//!
//! The worker never shares mutable state with the caller. Every status line,
//! progress step, error report and the final outcome is sent as a
//! [`PackageEvent`] over a channel, and the caller drains it on whichever thread
//! owns its UI. Cancellation is a [`CancelToken`] that the worker polls between
//! files and between archive entries, so an entry is never abandoned half
//! written.
//!
//! Whatever the outcome, the job's staging directory is removed and the
//! packager is free for the next job before the final
//! [`PackageEvent::Finished`] is sent.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::archive::{PackageWriter, SaveOutcome, StoredZipWriter};
use crate::config::{METADATA_FILE_NAME, PackagerConfig};
use crate::error::{PackageError, PackageResult};
use crate::files::{FileGroup, FileLists};
use crate::metadata::{ManifestEntry, MetadataPair, PackageDescriptor, SOURCE_RELATIONSHIP};
use crate::normalize::normalize_filename;
use crate::robust_io;
use crate::watch::PackageWatch;

/// Subdirectory of the staging directory that input files are copied into,
/// keeping them apart from the descriptor.
const STAGED_FILES_DIR: &str = "files";

const METADATA_ERROR: &str = "There was an error attempting to create a METS file for the session";
const ARCHIVE_ERROR: &str = "There was an error attempting to create an archive for the session";
const FILE_EXCLUDED: &str = "File excluded from the package.";
const SPECIAL_COPY_FAILED: &str =
    "The application could not prepare this file; it will be copied unchanged.";

/// Returns the description for a file, given its group key and path.
pub type DescribeFn = dyn Fn(&str, &Path) -> String + Send + Sync;
/// Supplies application-specific descriptor pairs.
pub type MetadataPairsFn = dyn Fn() -> Vec<MetadataPair> + Send + Sync;
/// Produces `dest` from `source` in place of a plain copy. `Ok(true)` means the
/// hook handled the file; `Ok(false)` asks for a plain copy.
pub type SpecialCopyFn =
    dyn Fn(&JobContext, &Path, &Path) -> anyhow::Result<bool> + Send + Sync;
/// Adjusts a normalized name, given the group key and the original file name.
pub type NormalizeFn = dyn Fn(&str, &str, &mut String) + Send + Sync;

/// Shared cancellation flag for a job.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    BuildingMetadata,
    StagingFiles,
    WritingPackage,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Failed)
    }

    /// Whether the pipeline allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Done | Cancelled | Failed, _) => false,
            (Idle, BuildingMetadata)
            | (BuildingMetadata, StagingFiles)
            | (StagingFiles, WritingPackage)
            | (WritingPackage, Done) => true,
            (BuildingMetadata | StagingFiles | WritingPackage, Cancelled) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::BuildingMetadata => "building metadata",
            JobState::StagingFiles => "staging files",
            JobState::WritingPackage => "writing the package",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a job ended.
#[derive(Clone, Debug, PartialEq)]
pub enum PackageOutcome {
    /// The package was written.
    Completed {
        package: PathBuf,
        descriptor: PackageDescriptor,
    },
    Cancelled,
    /// The job stopped on an error, which was reported as a
    /// [`PackageEvent::Error`] first.
    Failed,
}

impl PackageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PackageOutcome::Completed { .. })
    }

    pub fn package_path(&self) -> Option<&Path> {
        match self {
            PackageOutcome::Completed { package, .. } => Some(package),
            _ => None,
        }
    }
}

/// A message from a running job.
#[derive(Debug)]
pub enum PackageEvent {
    /// The job entered a new state.
    State(JobState),
    /// A phase heading, such as "Copying files". Does not advance progress.
    Status(String),
    /// One unit of work finished.
    Progress {
        message: String,
        completed: u64,
        total: u64,
    },
    /// An error and the message to show for it. Per-file errors are followed
    /// by more work; fatal ones by a `Failed` state.
    Error {
        error: PackageError,
        message: String,
    },
    /// The last event of every job.
    Finished(PackageOutcome),
}

/// What a special-copy hook may know about the job it runs in.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub title: String,
    pub id: String,
    /// Directory the staged files are written into.
    pub staging_dir: PathBuf,
    pub cancel: CancelToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
struct Hooks {
    describe: Option<Box<DescribeFn>>,
    metadata_pairs: Option<Box<MetadataPairsFn>>,
    special_copy: Option<Box<SpecialCopyFn>>,
    normalize: Option<Box<NormalizeFn>>,
}

struct Inner {
    title: String,
    id: String,
    config: PackagerConfig,
    hooks: Hooks,
    active: AtomicBool,
    watch: Mutex<Option<PackageWatch>>,
}

impl Inner {
    fn staged_name(&self, group: &str, source: &Path) -> String {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = normalize_filename(&file_name);
        if let Some(hook) = &self.hooks.normalize {
            hook(group, &file_name, &mut name);
        }
        name
    }

    fn describe(&self, group: &str, source: &Path) -> String {
        self.hooks
            .describe
            .as_ref()
            .map(|describe| describe(group, source))
            .unwrap_or_default()
    }

    fn release_watch(&self) {
        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watch) = watch {
            watch.stop();
        }
    }
}

/// Builds a [`Packager`].
pub struct PackagerBuilder {
    title: String,
    id: String,
    config: PackagerConfig,
    hooks: Hooks,
}

impl PackagerBuilder {
    pub fn config(mut self, config: PackagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the required file-description callback.
    pub fn file_description<F>(mut self, describe: F) -> Self
    where
        F: Fn(&str, &Path) -> String + Send + Sync + 'static,
    {
        self.hooks.describe = Some(Box::new(describe));
        self
    }

    pub fn metadata_pairs<F>(mut self, pairs: F) -> Self
    where
        F: Fn() -> Vec<MetadataPair> + Send + Sync + 'static,
    {
        self.hooks.metadata_pairs = Some(Box::new(pairs));
        self
    }

    pub fn special_copy<F>(mut self, copy: F) -> Self
    where
        F: Fn(&JobContext, &Path, &Path) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.hooks.special_copy = Some(Box::new(copy));
        self
    }

    pub fn filename_normalization<F>(mut self, normalize: F) -> Self
    where
        F: Fn(&str, &str, &mut String) + Send + Sync + 'static,
    {
        self.hooks.normalize = Some(Box::new(normalize));
        self
    }

    /// Validates the settings and creates the packager.
    ///
    /// Fails when the file-description callback is missing or the identifier
    /// cannot be used as a file name.
    pub fn build(self) -> PackageResult<Packager> {
        if self.hooks.describe.is_none() {
            return Err(PackageError::MissingCallback {
                name: "file_description",
            });
        }
        validate_id(&self.id)?;

        Ok(Packager {
            inner: Arc::new(Inner {
                title: self.title,
                id: self.id,
                config: self.config,
                hooks: self.hooks,
                active: AtomicBool::new(false),
                watch: Mutex::new(None),
            }),
        })
    }
}

fn validate_id(id: &str) -> PackageResult<()> {
    if id.trim().is_empty() {
        return Err(PackageError::invalid_input("id", "must not be empty", None));
    }
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(PackageError::invalid_input(
            "id",
            "must be usable as a file name",
            Some(id.to_string()),
        ));
    }
    Ok(())
}

fn validate_files(files: &FileLists) -> PackageResult<()> {
    if files.file_count() == 0 {
        return Err(PackageError::invalid_input(
            "files",
            "at least one file is required",
            None,
        ));
    }
    for (_, path) in files.iter() {
        if !path.is_file() {
            return Err(PackageError::invalid_input(
                "files",
                "file does not exist",
                Some(path.display().to_string()),
            ));
        }
        if path.file_name().is_none() {
            return Err(PackageError::invalid_input(
                "files",
                "path has no file name",
                Some(path.display().to_string()),
            ));
        }
    }
    Ok(())
}

/// Creates packages for one session. Runs at most one job at a time.
#[derive(Clone)]
pub struct Packager {
    inner: Arc<Inner>,
}

impl fmt::Debug for Packager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packager")
            .field("title", &self.inner.title)
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Packager {
    pub fn builder(title: impl Into<String>, id: impl Into<String>) -> PackagerBuilder {
        PackagerBuilder {
            title: title.into(),
            id: id.into(),
            config: PackagerConfig::default(),
            hooks: Hooks::default(),
        }
    }

    pub fn title(&self) -> &str {
        &self.inner.title
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &PackagerConfig {
        &self.inner.config
    }

    /// Where this packager writes its package.
    pub fn package_path(&self) -> PathBuf {
        self.inner.config.package_path(&self.inner.id)
    }

    /// Whether a job is running.
    pub fn is_busy(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Normalized archive name for `file_name` in group `group`, including the
    /// application's adjustments.
    pub fn normalized_name(&self, group: &str, file_name: &str) -> String {
        self.inner.staged_name(group, Path::new(file_name))
    }

    /// Starts a job with its own cancellation token.
    pub fn start(&self, files: FileLists) -> PackageResult<PackageJob> {
        self.start_with_cancel(files, CancelToken::new())
    }

    /// Starts a job on a worker thread.
    ///
    /// Input problems (no files, missing files) and a job already in progress
    /// are returned here, before anything is created on disk. Everything after
    /// that is reported through the job's events.
    pub fn start_with_cancel(
        &self,
        files: FileLists,
        cancel: CancelToken,
    ) -> PackageResult<PackageJob> {
        validate_files(&files)?;
        let active = ActiveGuard::acquire(&self.inner)?;

        let config = &self.inner.config;
        let staging = config
            .retry
            .run(|| {
                tempfile::Builder::new()
                    .prefix("rampkit-")
                    .tempdir_in(&config.staging_root)
            })
            .map_err(|e| PackageError::io("staging.create", &config.staging_root, e))?;

        let (tx, rx) = mpsc::channel();
        let total = files.total_units();
        let job = PackagingJob {
            inner: Arc::clone(&self.inner),
            files_dir: staging.path().join(STAGED_FILES_DIR),
            metadata_path: staging.path().join(METADATA_FILE_NAME),
            staging: Some(staging),
            package_path: self.package_path(),
            files,
            cancel: cancel.clone(),
            events: tx,
            state: JobState::Idle,
            completed: 0,
            total,
            staged: Vec::new(),
            active: Some(active),
        };
        let package_path = job.package_path.clone();

        let handle = thread::Builder::new()
            .name("rampkit-package".to_string())
            .spawn(move || job.run())
            .map_err(|_| PackageError::Worker {
                reason: "could not spawn worker thread",
            })?;

        info!(id = %self.inner.id, total, "packaging job started");
        Ok(PackageJob {
            inner: Arc::clone(&self.inner),
            events: rx,
            cancel,
            handle: Some(handle),
            total_units: total,
            package_path,
        })
    }

    /// Runs a job to completion on a worker, passing every event to `on_event`
    /// on the calling thread. Cancel through `cancel` from another thread or
    /// from inside `on_event`.
    pub fn create_package<F>(
        &self,
        files: FileLists,
        cancel: CancelToken,
        mut on_event: F,
    ) -> PackageResult<PackageOutcome>
    where
        F: FnMut(&PackageEvent),
    {
        let job = self.start_with_cancel(files, cancel)?;
        for event in job.events() {
            on_event(&event);
        }
        Ok(job.wait())
    }

    /// Watches a handed-off package and deletes it once it is no longer locked.
    /// Replaces (and stops) any earlier watch. Cancelling `cancel` ends the
    /// watch and leaves the package where it is.
    pub fn watch_package(&self, package: &Path, cancel: &CancelToken) -> PackageResult<()> {
        let watch = PackageWatch::start(
            package,
            self.inner.config.watch,
            self.inner.config.retry,
            cancel.clone(),
        )?;
        let previous = self
            .inner
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(watch);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Whether the last watched package is still being watched.
    pub fn is_watching(&self) -> bool {
        self.inner
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Blocks until the current watch, if any, ends. Returns `true` if it
    /// deleted its package.
    pub fn wait_for_watch(&self) -> bool {
        let watch = self
            .inner
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        watch.is_some_and(PackageWatch::wait)
    }

    /// Stops any package watch without deleting the package.
    pub fn release_watch(&self) {
        self.inner.release_watch();
    }
}

/// Marks the packager busy for the lifetime of one job.
struct ActiveGuard(Arc<Inner>);

impl ActiveGuard {
    fn acquire(inner: &Arc<Inner>) -> PackageResult<Self> {
        inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PackageError::Busy)?;
        Ok(Self(Arc::clone(inner)))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::SeqCst);
    }
}

/// Handle to a running job.
pub struct PackageJob {
    inner: Arc<Inner>,
    events: Receiver<PackageEvent>,
    cancel: CancelToken,
    handle: Option<JoinHandle<PackageOutcome>>,
    total_units: u64,
    package_path: PathBuf,
}

impl PackageJob {
    /// Events from the worker. Iterating ends after [`PackageEvent::Finished`].
    pub fn events(&self) -> &Receiver<PackageEvent> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Asks the job to stop at the next file or entry boundary, and tears down
    /// any package watch.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.inner.release_watch();
    }

    /// Progress units the job will report when everything is packaged.
    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Blocks until the worker is done and returns the outcome.
    pub fn wait(mut self) -> PackageOutcome {
        let Some(handle) = self.handle.take() else {
            return PackageOutcome::Failed;
        };
        handle.join().unwrap_or_else(|_| {
            error!("packaging worker panicked");
            PackageOutcome::Failed
        })
    }
}

struct StagedFile {
    /// Position of the file's entry in the manifest.
    index: usize,
    source: PathBuf,
    dest: PathBuf,
}

enum Stop {
    Cancelled,
    Failed(PackageError, String),
}

/// State owned by the worker for one run.
struct PackagingJob {
    inner: Arc<Inner>,
    files: FileLists,
    staging: Option<TempDir>,
    files_dir: PathBuf,
    metadata_path: PathBuf,
    package_path: PathBuf,
    cancel: CancelToken,
    events: Sender<PackageEvent>,
    state: JobState,
    completed: u64,
    total: u64,
    staged: Vec<StagedFile>,
    active: Option<ActiveGuard>,
}

impl PackagingJob {
    fn run(mut self) -> PackageOutcome {
        let outcome = match self.execute() {
            Ok(descriptor) => {
                self.transition(JobState::Done);
                PackageOutcome::Completed {
                    package: self.package_path.clone(),
                    descriptor,
                }
            }
            Err(Stop::Cancelled) => {
                self.status("Canceling...");
                self.discard_package();
                self.transition(JobState::Cancelled);
                PackageOutcome::Cancelled
            }
            Err(Stop::Failed(error, message)) => {
                error!(id = %self.inner.id, error = %error, "packaging failed");
                self.report(error, message);
                self.discard_package();
                self.transition(JobState::Failed);
                PackageOutcome::Failed
            }
        };

        self.clean_up();
        drop(self.active.take());
        info!(id = %self.inner.id, state = %self.state, "packaging job finished");
        self.send(PackageEvent::Finished(outcome.clone()));
        outcome
    }

    fn execute(&mut self) -> Result<PackageDescriptor, Stop> {
        self.enter(JobState::BuildingMetadata)?;
        self.check_cancel()?;
        robust_io::delete_file(&self.package_path, &self.inner.config.retry).map_err(|e| {
            self.archive_failure(PackageError::io("package.remove_stale", &self.package_path, e))
        })?;
        let mut descriptor = self.build_metadata()?;

        self.enter(JobState::StagingFiles)?;
        let dropped = self.stage_files(&descriptor)?;
        if !dropped.is_empty() {
            descriptor = descriptor.without(&dropped);
            self.write_metadata(&descriptor)?;
        }

        self.enter(JobState::WritingPackage)?;
        self.write_package()?;
        Ok(descriptor)
    }

    fn build_metadata(&mut self) -> Result<PackageDescriptor, Stop> {
        self.status("Building metadata file");

        // Compared case-insensitively; the descriptor's own name is taken.
        let mut names = HashSet::from([METADATA_FILE_NAME.to_lowercase()]);
        let mut entries = Vec::with_capacity(self.files.file_count());
        for (group, source) in self.files.iter() {
            let name = self.inner.staged_name(group, source);
            if !names.insert(name.to_lowercase()) {
                warn!(path = %source.display(), %name, "duplicate staged name; dropping file");
                self.report(
                    PackageError::NameCollision {
                        path: source.to_path_buf(),
                        name,
                    },
                    FILE_EXCLUDED.to_string(),
                );
                continue;
            }
            entries.push(ManifestEntry {
                group: group.to_string(),
                source: source.to_path_buf(),
                name,
                description: self.inner.describe(group, source),
                relationship: SOURCE_RELATIONSHIP,
            });
        }

        let descriptor = PackageDescriptor {
            title: self.inner.title.clone(),
            id: self.inner.id.clone(),
            app_pairs: self
                .inner
                .hooks
                .metadata_pairs
                .as_ref()
                .map(|pairs| pairs())
                .unwrap_or_default(),
            files: entries,
        };
        self.write_metadata(&descriptor)?;
        Ok(descriptor)
    }

    fn write_metadata(&self, descriptor: &PackageDescriptor) -> Result<(), Stop> {
        let mets = descriptor
            .to_mets()
            .map_err(|e| self.metadata_failure(e))?;
        robust_io::save_xml(&mets, &self.metadata_path, &self.inner.config.retry).map_err(|e| {
            self.metadata_failure(PackageError::io("metadata.write", &self.metadata_path, e))
        })?;
        debug!(path = %self.metadata_path.display(), files = descriptor.files.len(), "metadata written");
        Ok(())
    }

    /// Plans one staged file per manifest entry, group by group, then copies
    /// each into the staging directory. Returns the manifest indices of the
    /// files dropped along the way.
    fn stage_files(&mut self, descriptor: &PackageDescriptor) -> Result<HashSet<usize>, Stop> {
        self.status("Analyzing component files");
        self.inner
            .config
            .retry
            .run(|| fs::create_dir(&self.files_dir))
            .map_err(|e| self.archive_failure(PackageError::io("staging.create", &self.files_dir, e)))?;

        let groups: Vec<FileGroup> = self.files.groups().to_vec();
        for group in &groups {
            let label = if group.is_session() {
                self.inner.id.clone()
            } else {
                group.key.clone()
            };
            self.advance(label);
            for (index, entry) in descriptor.files.iter().enumerate() {
                if entry.group == group.key {
                    self.staged.push(StagedFile {
                        index,
                        source: entry.source.clone(),
                        dest: self.files_dir.join(&entry.name),
                    });
                }
            }
            self.check_cancel()?;
        }

        self.status("Copying files");
        let planned = std::mem::take(&mut self.staged);
        let mut kept = Vec::with_capacity(planned.len());
        let mut dropped = HashSet::new();
        for file in planned {
            self.check_cancel()?;
            self.advance(display_name(&file.source));
            if self.stage_one(&file)? {
                kept.push(file);
            } else {
                dropped.insert(file.index);
            }
        }
        self.staged = kept;
        Ok(dropped)
    }

    /// Stages one file. Returns `false` when the file is dropped.
    fn stage_one(&self, file: &StagedFile) -> Result<bool, Stop> {
        if let Some(copy) = self.inner.hooks.special_copy.as_deref() {
            match copy(&self.context(), &file.source, &file.dest) {
                Ok(true) if file.dest.is_file() => {
                    debug!(source = %file.source.display(), "staged by special copy");
                    return Ok(true);
                }
                Ok(true) => {
                    warn!(dest = %file.dest.display(), "special copy claimed success without a file");
                    self.report(
                        PackageError::SpecialCopyMissing {
                            path: file.dest.clone(),
                        },
                        FILE_EXCLUDED.to_string(),
                    );
                    return Ok(false);
                }
                Ok(false) => {}
                Err(source) => {
                    warn!(source = %file.source.display(), error = %source, "special copy failed");
                    self.report(
                        PackageError::SpecialCopy {
                            path: file.source.clone(),
                            source,
                        },
                        SPECIAL_COPY_FAILED.to_string(),
                    );
                }
            }
        }

        copy_file(
            &file.source,
            &file.dest,
            self.inner.config.copy_buffer_size,
            &self.inner.config.retry,
        )
        .map_err(|e| self.archive_failure(e))?;
        debug!(source = %file.source.display(), dest = %file.dest.display(), "staged");
        Ok(true)
    }

    fn write_package(&mut self) -> Result<(), Stop> {
        self.status("Saving files in package");

        let mut writer = StoredZipWriter::new(self.inner.config.copy_buffer_size);
        for file in &self.staged {
            writer
                .add_file(&file.dest)
                .map_err(|e| self.archive_failure(e))?;
        }
        writer.add_file_as(&self.metadata_path, METADATA_FILE_NAME);

        let package = self.package_path.clone();
        let cancel = self.cancel.clone();
        let outcome = writer.save(&package, &mut |entry| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            self.advance(entry.name.to_string());
            ControlFlow::Continue(())
        });

        match outcome.map_err(|e| self.archive_failure(e))? {
            SaveOutcome::Saved { entries } => {
                info!(package = %package.display(), entries, "package written");
                Ok(())
            }
            SaveOutcome::Stopped { .. } => Err(Stop::Cancelled),
        }
    }

    fn context(&self) -> JobContext {
        JobContext {
            title: self.inner.title.clone(),
            id: self.inner.id.clone(),
            staging_dir: self.files_dir.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn check_cancel(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    fn metadata_failure(&self, error: PackageError) -> Stop {
        Stop::Failed(error, format!("{METADATA_ERROR} '{}'.", self.inner.title))
    }

    fn archive_failure(&self, error: PackageError) -> Stop {
        Stop::Failed(error, format!("{ARCHIVE_ERROR} '{}'.", self.inner.title))
    }

    fn enter(&mut self, next: JobState) -> Result<(), Stop> {
        if !self.state.can_transition_to(next) {
            return Err(Stop::Failed(
                PackageError::InvalidState {
                    operation: "advance",
                    state: self.state,
                },
                format!("{ARCHIVE_ERROR} '{}'.", self.inner.title),
            ));
        }
        self.transition(next);
        Ok(())
    }

    fn transition(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "ignoring invalid state change");
            return;
        }
        debug!(from = %self.state, to = %next, "job state");
        self.state = next;
        self.send(PackageEvent::State(next));
    }

    fn advance(&mut self, message: String) {
        self.completed = (self.completed + 1).min(self.total);
        self.send(PackageEvent::Progress {
            message,
            completed: self.completed,
            total: self.total,
        });
    }

    fn status(&self, message: &str) {
        self.send(PackageEvent::Status(message.to_string()));
    }

    fn report(&self, error: PackageError, message: String) {
        self.send(PackageEvent::Error { error, message });
    }

    fn send(&self, event: PackageEvent) {
        // The caller may have stopped listening; the job still runs to the end.
        let _ = self.events.send(event);
    }

    fn discard_package(&self) {
        if let Err(e) = robust_io::delete_file(&self.package_path, &self.inner.config.retry) {
            warn!(package = %self.package_path.display(), error = %e, "could not remove partial package");
        }
    }

    /// Removes the staging directory. Failures are logged and swallowed.
    fn clean_up(&mut self) {
        if let Some(staging) = self.staging.take() {
            if let Err(e) = robust_io::delete_dir_all(staging.path(), &self.inner.config.retry) {
                warn!(path = %staging.path().display(), error = %e, "could not remove staging directory");
            }
            drop(staging);
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Copies `src` to `dest` with an explicit read/write loop.
fn copy_file(
    src: &Path,
    dest: &Path,
    buffer_size: usize,
    policy: &crate::retry::RetryPolicy,
) -> PackageResult<u64> {
    let mut input = policy
        .run(|| File::open(src))
        .map_err(|e| PackageError::io("stage.open_source", src, e))?;
    let mut output = policy
        .run(|| File::create(dest))
        .map_err(|e| PackageError::io("stage.create_dest", dest, e))?;

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;
    loop {
        let n = input
            .read(&mut buffer)
            .map_err(|e| PackageError::io("stage.read", src, e))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buffer[..n])
            .map_err(|e| PackageError::io("stage.write", dest, e))?;
        total += n as u64;
    }
    output
        .flush()
        .map_err(|e| PackageError::io("stage.flush", dest, e))?;
    Ok(total)
}
