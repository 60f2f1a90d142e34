//! End-to-end pack-and-deliver scenarios against in-process sinks

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use capsule::core::{
    pack_and_deliver, BatchPlanner, DeliveryPipeline, EventPublisher, PackEvent, WalkDirWalker,
};
use capsule::error::{EXIT_PARTIAL, EXIT_SUCCESS};
use capsule::sink::{LocalDirSink, TransportError, UploadSink};
use capsule::PackConfig;
use tempfile::TempDir;

/// Copies into a local directory, failing the calls listed in `fail_on` (1-based)
struct ScriptedSink {
    inner: LocalDirSink,
    fail_on: Vec<usize>,
    calls: RefCell<Vec<PathBuf>>,
}

impl ScriptedSink {
    fn new(remote: &Path, fail_on: &[usize]) -> Self {
        Self {
            inner: LocalDirSink::new(remote),
            fail_on: fail_on.to_vec(),
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl UploadSink for ScriptedSink {
    fn upload(&self, path: &Path, destination: &str) -> Result<String, TransportError> {
        self.calls.borrow_mut().push(path.to_path_buf());
        let call = self.calls.borrow().len();
        if self.fail_on.contains(&call) {
            return Err(TransportError::from_status(
                503,
                "service unavailable".to_string(),
            ));
        }
        self.inner.upload(path, destination)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Fixture {
    temp: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir_all(&root).unwrap();
        Self { temp, root }
    }

    fn file(&self, rel: &str, size: usize) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'z'; size]).unwrap();
        path
    }

    fn config(&self, bound: u64) -> PackConfig {
        PackConfig::with_bound(bound).with_staging_dir(self.temp.path().join("staging"))
    }

    fn remote(&self) -> PathBuf {
        self.temp.path().join("remote")
    }

    fn remote_archives(&self) -> Vec<PathBuf> {
        let dir = self.remote().join("folder");
        if !dir.exists() {
            return Vec::new();
        }
        let mut archives: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        archives.sort();
        archives
    }

    fn staged_archives(&self) -> Vec<PathBuf> {
        let mut archives: Vec<PathBuf> = fs::read_dir(self.temp.path().join("staging"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        archives.sort();
        archives
    }
}

fn entry_names(archive: &Path) -> Vec<String> {
    let zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    names
}

fn planner(config: &PackConfig, publisher: EventPublisher) -> BatchPlanner {
    BatchPlanner::new(config, "data")
        .with_walker(WalkDirWalker::sorted())
        .with_publisher(publisher)
}

#[test]
fn test_four_files_under_three_and_a_half_bound() {
    let fx = Fixture::new();
    for name in ["f1.bin", "f2.bin", "f3.bin", "f4.bin"] {
        fx.file(name, 1000);
    }

    let config = fx.config(3500);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", false);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(summary.plan.batches_sealed, 2);
    assert_eq!(summary.uploads_succeeded, 2);
    assert_eq!(pipeline.sink().calls.borrow().len(), 2);

    let remote = fx.remote_archives();
    assert_eq!(remote.len(), 2);
    assert_eq!(entry_names(&remote[0]), vec!["f1.bin", "f2.bin", "f3.bin"]);
    assert_eq!(entry_names(&remote[1]), vec!["f4.bin"]);
    assert_eq!(summary.exit_code(), EXIT_SUCCESS);
}

#[test]
fn test_single_file_over_bound_gets_its_own_archive() {
    let fx = Fixture::new();
    fx.file("huge.iso", 5000);

    let (publisher, subscriber) = EventPublisher::unbounded();
    let config = fx.config(3500);
    let planner = planner(&config, publisher);
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", false);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(summary.plan.batches_sealed, 1);
    assert_eq!(summary.plan.oversize_batches, 1);
    assert_eq!(entry_names(&fx.remote_archives()[0]), vec!["huge.iso"]);

    let sealed: Vec<(u64, bool)> = subscriber
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            PackEvent::ArchiveSealed {
                total_bytes,
                oversize,
                ..
            } => Some((total_bytes, oversize)),
            _ => None,
        })
        .collect();
    assert_eq!(sealed, vec![(5000, true)]);
}

#[test]
fn test_excluded_log_is_never_staged() {
    let fx = Fixture::new();
    fx.file("a.txt", 10);
    let log = fx.file("b.log", 10);

    let config = fx.config(1000).with_exclusions(["*.log"]).with_delete_after_send(true);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", true);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(summary.plan.files_archived, 1);
    assert_eq!(summary.plan.files_skipped, 1);
    assert_eq!(entry_names(&fx.remote_archives()[0]), vec!["a.txt"]);
    // excluded files are left alone even when deleting after send
    assert!(log.exists());
}

#[test]
fn test_failed_second_batch_keeps_its_files_and_run_continues() {
    let fx = Fixture::new();
    let f1 = fx.file("1.dat", 100);
    let f2 = fx.file("2.dat", 100);
    let f3 = fx.file("3.dat", 100);

    let config = fx.config(100).with_delete_after_send(true);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[2]), "folder", true);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(pipeline.sink().calls.borrow().len(), 3);
    assert_eq!(summary.uploads_succeeded, 2);
    assert_eq!(summary.uploads_failed, 1);
    assert_eq!(summary.files_deleted, 2);
    assert_eq!(summary.exit_code(), EXIT_PARTIAL);

    assert!(!f1.exists());
    assert!(f2.exists());
    assert!(!f3.exists());

    assert_eq!(summary.failed_archives.len(), 1);
    let kept = &summary.failed_archives[0];
    assert!(kept.exists());
    assert_eq!(entry_names(kept), vec!["2.dat"]);
    assert_eq!(fx.staged_archives(), vec![kept.clone()]);
    assert_eq!(fx.remote_archives().len(), 2);
}

#[test]
fn test_without_delete_nothing_is_removed() {
    let fx = Fixture::new();
    let files: Vec<PathBuf> = (0..5).map(|i| fx.file(&format!("f{}.txt", i), 60)).collect();

    let config = fx.config(150);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[1]), "folder", false);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(summary.plan.batches_sealed, 3);
    assert_eq!(summary.files_deleted, 0);
    assert!(files.iter().all(|f| f.exists()));
    assert_eq!(fx.staged_archives().len(), 3);
}

#[test]
fn test_nested_tree_preserves_relative_paths_once_each() {
    let fx = Fixture::new();
    let mut expected = HashSet::new();
    for (i, rel) in ["a/one.txt", "a/b/two.txt", "c/three.txt", "four.txt", "a/b/c/five.txt"]
        .iter()
        .enumerate()
    {
        fx.file(rel, 40 + i * 10);
        expected.insert(rel.to_string());
    }

    let config = fx.config(120);
    let planner = BatchPlanner::new(&config, "data");
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", false);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    let mut seen = HashSet::new();
    for archive in fx.remote_archives() {
        for name in entry_names(&archive) {
            assert!(seen.insert(name), "entry archived twice");
        }
    }
    assert_eq!(seen, expected);
    assert_eq!(summary.plan.files_archived, 5);
}

#[test]
fn test_archive_contents_match_sources() {
    let fx = Fixture::new();
    let path = fx.root.join("notes/readme.md");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"# capsule\nsize-bounded archives\n").unwrap();

    let config = fx.config(1000);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", false);
    pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    let mut zip = zip::ZipArchive::new(File::open(&fx.remote_archives()[0]).unwrap()).unwrap();
    let mut contents = String::new();
    zip.by_name("notes/readme.md")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "# capsule\nsize-bounded archives\n");
}

#[test]
fn test_event_stream_reconstructs_run() {
    let fx = Fixture::new();
    fx.file("a.txt", 80);
    fx.file("b.txt", 80);
    fx.file("skip.log", 10);

    let (publisher, subscriber) = EventPublisher::unbounded();
    let config = fx.config(100).with_exclusions(["*.log"]);
    let planner = planner(&config, publisher.clone());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", true)
        .with_publisher(publisher);

    pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    let mut opened = 0;
    let mut sealed = 0;
    let mut uploaded = 0;
    let mut deleted = 0;
    let mut skipped = 0;
    let mut complete = false;
    for event in subscriber.drain() {
        match event {
            PackEvent::ArchiveOpened { .. } => opened += 1,
            PackEvent::ArchiveSealed { .. } => sealed += 1,
            PackEvent::UploadSucceeded { .. } => uploaded += 1,
            PackEvent::FileDeleted { .. } => deleted += 1,
            PackEvent::CandidateSkipped { .. } => skipped += 1,
            PackEvent::RunComplete { batches, .. } => {
                assert_eq!(batches, 2);
                complete = true;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!((opened, sealed, uploaded, skipped), (2, 2, 2, 1));
    // two sources and two archives
    assert_eq!(deleted, 4);
    assert!(complete);
}

#[cfg(unix)]
#[test]
fn test_linked_file_is_archived_and_only_the_link_deleted() {
    use std::os::unix::fs::symlink;

    let fx = Fixture::new();
    fx.file("real.txt", 10);
    let target = fx.temp.path().join("outside.txt");
    fs::write(&target, b"linked contents").unwrap();
    let link = fx.root.join("link.txt");
    symlink(&target, &link).unwrap();

    let config = fx.config(1000).with_delete_after_send(true);
    let planner = planner(&config, EventPublisher::noop());
    let pipeline = DeliveryPipeline::new(ScriptedSink::new(&fx.remote(), &[]), "folder", true);

    let summary = pack_and_deliver(&fx.root, &planner, &pipeline).unwrap();

    assert_eq!(summary.plan.files_archived, 2);
    assert_eq!(summary.plan.files_skipped, 0);
    let mut zip = zip::ZipArchive::new(File::open(&fx.remote_archives()[0]).unwrap()).unwrap();
    let mut contents = String::new();
    zip.by_name("link.txt")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "linked contents");

    assert!(fs::symlink_metadata(&link).is_err());
    assert!(target.exists());
}
