use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use rampkit_core::archive::{list_entries, read_entry};
use rampkit_core::config::{PackagerConfig, WatchConfig};
use rampkit_core::files::FileLists;
use rampkit_core::metadata::{MetadataPair, decode_payload};
use rampkit_core::package::{CancelToken, JobState, PackageEvent, PackageOutcome, Packager, PackagerBuilder};
use rampkit_core::retry::{Backoff, RetryPolicy};
use rampkit_core::robust_io::XmlDocument;
use rampkit_core::PackageError;
use tempfile::TempDir;
use zip::CompressionMethod;

struct Fixture {
    temp: TempDir,
    files: FileLists,
}

impl Fixture {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        for dir in ["in", "stage", "out"] {
            fs::create_dir(temp.path().join(dir))?;
        }
        let input = temp.path().join("in");
        fs::write(input.join("a.wav"), b"RIFF....WAVE")?;
        fs::write(input.join("b.txt"), "transcript line one\n")?;
        fs::write(input.join("c.mp4"), [7u8; 2048])?;

        let mut files = FileLists::new();
        files
            .add("", input.join("a.wav"))
            .add("", input.join("b.txt"))
            .add("Contributor1", input.join("c.mp4"));
        Ok(Self { temp, files })
    }

    fn input(&self, name: &str) -> PathBuf {
        self.temp.path().join("in").join(name)
    }

    fn stage_root(&self) -> PathBuf {
        self.temp.path().join("stage")
    }

    fn config(&self) -> PackagerConfig {
        PackagerConfig {
            staging_root: self.stage_root(),
            output_dir: self.temp.path().join("out"),
            copy_buffer_size: 512,
            retry: RetryPolicy::default().with_backoff(Backoff::Fixed(Duration::ZERO)),
            watch: WatchConfig {
                initial_delay: Duration::from_millis(10),
                interval: Duration::from_millis(20),
            },
            ..PackagerConfig::default()
        }
    }

    fn builder(&self) -> PackagerBuilder {
        Packager::builder("Morning story", "session-001")
            .config(self.config())
            .file_description(|group, file| {
                let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                if group.is_empty() {
                    format!("Session file {name}")
                } else {
                    format!("{group} file {name}")
                }
            })
    }

    fn staging_is_empty(&self) -> Result<bool> {
        Ok(fs::read_dir(self.stage_root())?.next().is_none())
    }
}

#[derive(Debug)]
enum Seen {
    State(JobState),
    Status(String),
    Progress(u64, u64),
    Error(String),
    Finished(bool),
}

fn run(packager: &Packager, files: FileLists, cancel: CancelToken) -> Result<(PackageOutcome, Vec<Seen>)> {
    let mut seen = Vec::new();
    let outcome = packager.create_package(files, cancel, |event| {
        seen.push(match event {
            PackageEvent::State(state) => Seen::State(*state),
            PackageEvent::Status(message) => Seen::Status(message.clone()),
            PackageEvent::Progress { completed, total, .. } => Seen::Progress(*completed, *total),
            PackageEvent::Error { error, .. } => Seen::Error(error.to_string()),
            PackageEvent::Finished(outcome) => Seen::Finished(outcome.is_success()),
        });
    })?;
    Ok((outcome, seen))
}

fn progress(seen: &[Seen]) -> Vec<u64> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Progress(completed, _) => Some(*completed),
            _ => None,
        })
        .collect()
}

fn errors(seen: &[Seen]) -> Vec<&str> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Error(message) => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

fn packaged_mets(package: &Path) -> Result<serde_json::Value> {
    let mets = String::from_utf8(read_entry(package, "mets.xml")?)?;
    decode_payload(&XmlDocument::parse(mets)?).ok_or_else(|| anyhow!("mets payload missing"))
}

#[test]
fn packages_session_and_contributor_files() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture
        .builder()
        .metadata_pairs(|| vec![MetadataPair::new("dc.language", "eng")])
        .build()?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;

    let PackageOutcome::Completed { package, descriptor } = outcome else {
        return Err(anyhow!("expected a completed package"));
    };
    assert_eq!(package, fixture.temp.path().join("out").join("session-001.ramp"));

    assert_eq!(descriptor.files.len(), 3);
    assert!(descriptor.files.iter().all(|f| f.relationship == "source"));
    let payload = descriptor.payload();
    assert_eq!(payload["dc.type.mode"], serde_json::json!(["Speech", "Text", "Video"]));
    assert_eq!(payload["dc.language"], "eng");
    assert_eq!(payload["files"]["2"]["description"], "Contributor1 file c.mp4");

    let entries = list_entries(&package)?;
    let mut names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["a.wav", "b.txt", "c.mp4", "mets.xml"]);
    assert!(entries.iter().all(|(_, m)| *m == CompressionMethod::Stored));
    assert_eq!(read_entry(&package, "c.mp4")?, vec![7u8; 2048]);
    assert_eq!(packaged_mets(&package)?, payload);

    let steps = progress(&seen);
    let total = fixture.files.total_units();
    assert_eq!(total, 2 + 2 * 3 + 1);
    assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(steps.last().copied(), Some(total));
    assert!(steps.iter().all(|&s| s <= total));
    assert!(seen.iter().all(|s| !matches!(s, Seen::Progress(_, t) if *t != total)));

    let states: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::State(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        [JobState::BuildingMetadata, JobState::StagingFiles, JobState::WritingPackage, JobState::Done]
    );
    assert!(seen.iter().any(|s| matches!(s, Seen::Status(m) if m == "Copying files")));
    assert!(matches!(seen.last(), Some(Seen::Finished(true))));
    assert!(errors(&seen).is_empty());
    assert!(fixture.staging_is_empty()?);
    assert!(!packager.is_busy());
    Ok(())
}

#[test]
fn normalized_names_are_used_in_manifest_and_archive() -> Result<()> {
    let fixture = Fixture::new()?;
    let source = fixture.input("my take.v2.wav");
    fs::write(&source, "audio")?;
    let mut files = FileLists::new();
    files.add("", &source);

    let packager = fixture.builder().build()?;
    let (outcome, _) = run(&packager, files, CancelToken::new())?;
    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?;

    let names: Vec<_> = list_entries(package)?.into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"my+take#v2.wav".to_string()));
    assert_eq!(packaged_mets(package)?["files"]["0"][" "], "my+take#v2.wav");
    Ok(())
}

fn entry_names(package: &Path) -> Result<Vec<String>> {
    let mut names: Vec<_> = list_entries(package)?.into_iter().map(|(n, _)| n).collect();
    names.sort_unstable();
    Ok(names)
}

fn states(seen: &[Seen]) -> Vec<JobState> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::State(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
fn input_named_like_the_descriptor_is_dropped() -> Result<()> {
    let fixture = Fixture::new()?;
    for name in ["mets.xml", "METS.XML"] {
        let impostor = fixture.temp.path().join(name);
        fs::write(&impostor, "<user>not the descriptor</user>")?;
        let mut files = FileLists::new();
        files.add("", fixture.input("a.wav")).add("", &impostor);

        let packager = fixture.builder().build()?;
        let (outcome, seen) = run(&packager, files, CancelToken::new())?;

        let PackageOutcome::Completed { package, descriptor } = outcome else {
            return Err(anyhow!("expected a completed package"));
        };
        let names: Vec<_> = descriptor.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.wav"]);
        let errors = errors(&seen);
        assert_eq!(errors.len(), 1, "{name}");
        assert!(errors[0].contains(name));

        assert_eq!(entry_names(&package)?, ["a.wav", "mets.xml"]);
        let payload = packaged_mets(&package)?;
        assert_eq!(payload["dc.title"], "Morning story");
        assert_eq!(payload["files"].as_object().map(|o| o.len()), Some(1));
        fs::remove_file(&impostor)?;
    }
    Ok(())
}

#[test]
fn same_source_in_two_groups_is_packaged_once() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut files = FileLists::new();
    files.add("", fixture.input("a.wav")).add("Pat", fixture.input("a.wav"));

    let packager = fixture.builder().build()?;
    let (outcome, seen) = run(&packager, files, CancelToken::new())?;

    let PackageOutcome::Completed { package, descriptor } = outcome else {
        return Err(anyhow!("expected a completed package"));
    };
    assert_eq!(descriptor.files.len(), 1);
    assert_eq!(descriptor.files[0].group, "");
    assert_eq!(errors(&seen).len(), 1);
    assert_eq!(entry_names(&package)?, ["a.wav", "mets.xml"]);
    Ok(())
}

#[test]
fn same_source_under_distinct_names_is_staged_per_entry() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut files = FileLists::new();
    files.add("", fixture.input("a.wav")).add("Pat", fixture.input("a.wav"));

    let packager = fixture
        .builder()
        .filename_normalization(|group, _, name| {
            if !group.is_empty() {
                name.insert_str(0, &format!("{group}_"));
            }
        })
        .build()?;
    let (outcome, seen) = run(&packager, files, CancelToken::new())?;

    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?;
    assert!(errors(&seen).is_empty());
    assert_eq!(entry_names(package)?, ["Pat_a.wav", "a.wav", "mets.xml"]);
    assert_eq!(read_entry(package, "Pat_a.wav")?, b"RIFF....WAVE");
    assert_eq!(packaged_mets(package)?["files"]["1"][" "], "Pat_a.wav");
    Ok(())
}

#[test]
fn special_copy_that_lies_drops_only_that_file() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture
        .builder()
        .special_copy(|_, source, _dest| Ok(source.extension().is_some_and(|e| e == "txt")))
        .build()?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;

    let PackageOutcome::Completed { package, descriptor } = outcome else {
        return Err(anyhow!("expected a completed package"));
    };
    let names: Vec<_> = descriptor.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["a.wav", "c.mp4"]);
    assert_eq!(descriptor.payload()["dc.type.mode"], serde_json::json!(["Speech", "Video"]));

    let errors = errors(&seen);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("b.txt"));

    assert_eq!(list_entries(&package)?.len(), 3);
    assert_eq!(packaged_mets(&package)?["files"].as_object().map(|o| o.len()), Some(2));
    assert!(progress(&seen).iter().all(|&s| s <= fixture.files.total_units()));
    Ok(())
}

#[test]
fn special_copy_can_transform_content() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture
        .builder()
        .special_copy(|_, source, dest| {
            if source.extension().is_some_and(|e| e == "txt") {
                fs::write(dest, fs::read_to_string(source)?.to_uppercase())?;
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .build()?;

    let (outcome, _) = run(&packager, fixture.files.clone(), CancelToken::new())?;
    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?;
    assert_eq!(read_entry(package, "b.txt")?, b"TRANSCRIPT LINE ONE\n");
    assert_eq!(read_entry(package, "a.wav")?, b"RIFF....WAVE");
    Ok(())
}

#[test]
fn failing_special_copy_falls_back_to_plain_copy() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture
        .builder()
        .special_copy(|_, _, _| Err(anyhow!("converter crashed")))
        .build()?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;
    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?;
    assert_eq!(list_entries(package)?.len(), 4);
    assert_eq!(errors(&seen).len(), 3);
    Ok(())
}

#[test]
fn cancelling_mid_staging_leaves_no_package() -> Result<()> {
    let fixture = Fixture::new()?;
    let staging_dir: Arc<Mutex<Option<PathBuf>>> = Arc::default();
    let seen_dir = Arc::clone(&staging_dir);
    let packager = fixture
        .builder()
        .special_copy(move |job, _, _| {
            *seen_dir.lock().unwrap() = Some(job.staging_dir.clone());
            job.cancel.cancel();
            Ok(false)
        })
        .build()?;
    fs::write(packager.package_path(), "stale package from an earlier run")?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;

    assert_eq!(outcome, PackageOutcome::Cancelled);
    assert!(!packager.package_path().exists());
    let staging_dir = staging_dir.lock().unwrap().clone().ok_or_else(|| anyhow!("hook never ran"))?;
    assert!(!staging_dir.exists());
    assert!(fixture.staging_is_empty()?);
    assert!(seen.iter().any(|s| matches!(s, Seen::State(JobState::Cancelled))));
    assert!(!seen.iter().any(|s| matches!(s, Seen::State(JobState::WritingPackage))));
    assert!(matches!(seen.last(), Some(Seen::Finished(false))));
    Ok(())
}

#[test]
fn cancelling_while_writing_removes_partial_package() -> Result<()> {
    let fixture = Fixture::new()?;
    // The last staged file trips the token, so the writer sees it before its
    // first entry.
    let packager = fixture
        .builder()
        .special_copy(|job, source, _| {
            if source.extension().is_some_and(|e| e == "mp4") {
                job.cancel.cancel();
            }
            Ok(false)
        })
        .build()?;
    fs::write(packager.package_path(), "stale package from an earlier run")?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;

    assert_eq!(outcome, PackageOutcome::Cancelled);
    assert_eq!(
        states(&seen),
        [
            JobState::BuildingMetadata,
            JobState::StagingFiles,
            JobState::WritingPackage,
            JobState::Cancelled
        ]
    );
    let writing_at = seen
        .iter()
        .position(|s| matches!(s, Seen::State(JobState::WritingPackage)))
        .ok_or_else(|| anyhow!("never reached the writer"))?;
    assert!(!seen[writing_at..].iter().any(|s| matches!(s, Seen::Progress(..))));
    assert!(!packager.package_path().exists());
    assert!(fixture.staging_is_empty()?);
    assert!(matches!(seen.last(), Some(Seen::Finished(false))));
    Ok(())
}

#[test]
fn cancelled_before_start_never_stages() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture.builder().build()?;
    let cancel = CancelToken::new();
    cancel.cancel();

    let (outcome, seen) = run(&packager, fixture.files.clone(), cancel)?;
    assert_eq!(outcome, PackageOutcome::Cancelled);
    assert!(progress(&seen).is_empty());
    assert!(!packager.package_path().exists());
    assert!(fixture.staging_is_empty()?);
    Ok(())
}

#[test]
fn write_failure_is_reported_before_failing() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut config = fixture.config();
    config.output_dir = fixture.temp.path().join("missing-output-dir");
    let packager = fixture.builder().config(config).build()?;

    let (outcome, seen) = run(&packager, fixture.files.clone(), CancelToken::new())?;

    assert_eq!(outcome, PackageOutcome::Failed);
    let error_at = seen.iter().position(|s| matches!(s, Seen::Error(_)));
    let failed_at = seen.iter().position(|s| matches!(s, Seen::State(JobState::Failed)));
    assert!(error_at.is_some());
    assert!(error_at < failed_at);
    assert!(fixture.staging_is_empty()?);
    Ok(())
}

#[test]
fn one_job_at_a_time() -> Result<()> {
    let fixture = Fixture::new()?;
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let packager = fixture
        .builder()
        .special_copy(move |_, _, _| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(false)
        })
        .build()?;

    let job = packager.start(fixture.files.clone())?;
    assert!(packager.is_busy());
    assert!(matches!(packager.start(fixture.files.clone()), Err(PackageError::Busy)));

    drop(release_tx);
    assert!(job.wait().is_success());
    assert!(!packager.is_busy());
    Ok(())
}

#[test]
fn packager_is_free_once_finished_is_seen() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture.builder().build()?;

    let job = packager.start(fixture.files.clone())?;
    let finished = job
        .events()
        .iter()
        .any(|event| matches!(event, PackageEvent::Finished(_)));
    assert!(finished);
    assert!(!packager.is_busy());

    let again = packager.start(fixture.files.clone())?;
    assert!(again.wait().is_success());
    assert!(job.wait().is_success());
    Ok(())
}

#[test]
fn cancelled_hand_off_keeps_package() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut config = fixture.config();
    config.watch = WatchConfig {
        initial_delay: Duration::from_secs(60),
        interval: Duration::from_secs(60),
    };
    let packager = fixture.builder().config(config).build()?;
    let (outcome, _) = run(&packager, fixture.files.clone(), CancelToken::new())?;
    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?.to_path_buf();

    let cancel = CancelToken::new();
    packager.watch_package(&package, &cancel)?;
    cancel.cancel();
    assert!(!packager.wait_for_watch());
    assert!(package.exists());
    Ok(())
}

#[test]
fn handed_off_package_is_deleted_once_released() -> Result<()> {
    let fixture = Fixture::new()?;
    let packager = fixture.builder().build()?;
    let (outcome, _) = run(&packager, fixture.files.clone(), CancelToken::new())?;
    let package = outcome.package_path().ok_or_else(|| anyhow!("no package"))?.to_path_buf();

    packager.watch_package(&package, &CancelToken::new())?;
    assert!(packager.wait_for_watch());
    assert!(!package.exists());
    assert!(!packager.is_watching());
    Ok(())
}
