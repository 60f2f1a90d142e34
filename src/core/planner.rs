/*!
 * Batch planning: one traversal pass driving a sequence of bounded archives
 *
 * Exactly one archive is open at a time. It is sealed and handed to the
 * caller's `emit` callback as soon as the next candidate would push it past
 * the bound, so batches are delivered while traversal is still running.
 *
 * A file larger than the bound on its own is isolated: it lands alone in an
 * archive that is flagged as oversize when sealed.
 */

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::archive::{Archive, ArchiveBuilder, Batch, CandidateFile};
use super::events::{EventPublisher, SkipReason};
use super::filter::ExclusionFilter;
use super::walk::{DirectoryWalker, FileStat, FsStat, WalkDirWalker, WalkEntry};
use crate::config::PackConfig;
use crate::error::{CapsuleError, Result, StorageOp};

/// Counters for one planning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub files_archived: u64,
    pub bytes_archived: u64,
    pub files_skipped: u64,
    pub batches_sealed: u64,
    pub archives_discarded: u64,
    pub oversize_batches: u64,
}

/// State carried across one `plan` call
struct Cursor {
    current: Option<Archive>,
    next_sequence: u32,
    summary: PlanSummary,
}

/// Walks a tree and groups eligible files into sealed batches
pub struct BatchPlanner<W = WalkDirWalker, T = FsStat> {
    builder: ArchiveBuilder,
    filter: ExclusionFilter,
    walker: W,
    stat: T,
    publisher: EventPublisher,
}

impl BatchPlanner {
    /// Planner over the local filesystem in `walkdir` order
    pub fn new(config: &PackConfig, prefix: impl Into<String>) -> Self {
        Self {
            builder: ArchiveBuilder::new(config, prefix),
            filter: ExclusionFilter::new(&config.exclusion_patterns),
            walker: WalkDirWalker::new(),
            stat: FsStat,
            publisher: EventPublisher::noop(),
        }
    }
}

impl<W: DirectoryWalker, T: FileStat> BatchPlanner<W, T> {
    pub fn with_walker<W2: DirectoryWalker>(self, walker: W2) -> BatchPlanner<W2, T> {
        BatchPlanner {
            builder: self.builder,
            filter: self.filter,
            walker,
            stat: self.stat,
            publisher: self.publisher,
        }
    }

    pub fn with_stat<T2: FileStat>(self, stat: T2) -> BatchPlanner<W, T2> {
        BatchPlanner {
            builder: self.builder,
            filter: self.filter,
            walker: self.walker,
            stat,
            publisher: self.publisher,
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn builder(&self) -> &ArchiveBuilder {
        &self.builder
    }

    /// Run one traversal of `root`, calling `emit` for every sealed batch.
    ///
    /// `emit` runs before traversal resumes. An error from `emit` stops the
    /// pass. Skipped files are published and counted, never fatal.
    pub fn plan<F>(&self, root: &Path, mut emit: F) -> Result<PlanSummary>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let root = fs::canonicalize(root).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CapsuleError::NotFound(root.to_path_buf()),
            _ => CapsuleError::Io(e),
        })?;
        let staging = self.staging_root()?;
        debug!(
            "Planning {} with bound {} bytes, staging in {}",
            root.display(),
            self.builder.bound(),
            staging.display()
        );

        let mut cursor = Cursor {
            current: None,
            next_sequence: 1,
            summary: PlanSummary::default(),
        };

        for entry in self.walker.walk(&root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Traversal error under {}: {}", root.display(), e);
                    self.skip(&mut cursor, root.clone(), SkipReason::WalkError(e.to_string()));
                    continue;
                }
            };

            let Some(candidate) = self.screen(&mut cursor, &root, &staging, &entry) else {
                continue;
            };

            if let Err(e) = self.admit(&mut cursor, &candidate, &mut emit) {
                if let Some(archive) = cursor.current.take() {
                    self.abandon(&mut cursor, archive, &e);
                }
                return Err(e);
            }
        }

        self.finish(&mut cursor, &mut emit)?;

        debug!("Planning finished: {:?}", cursor.summary);
        Ok(cursor.summary)
    }

    /// Staging directory as a canonical path, created if needed
    fn staging_root(&self) -> Result<PathBuf> {
        let staging = self.builder.staging_dir();
        fs::create_dir_all(staging)
            .map_err(|e| CapsuleError::storage(StorageOp::CreateArchive, staging, e))?;
        fs::canonicalize(staging)
            .map_err(|e| CapsuleError::storage(StorageOp::CreateArchive, staging, e))
    }

    /// Turn a walk entry into a candidate, or record why it is skipped
    fn screen(
        &self,
        cursor: &mut Cursor,
        root: &Path,
        staging: &Path,
        entry: &WalkEntry,
    ) -> Option<CandidateFile> {
        let path = entry.path();
        let file_name = entry.file_name.to_string_lossy();

        if let Some(pattern) = self.filter.matching_pattern(&file_name) {
            let pattern = pattern.as_str().to_string();
            debug!("Excluded {} by '{}'", path.display(), pattern);
            self.skip(cursor, path, SkipReason::Excluded { pattern });
            return None;
        }

        if path.starts_with(staging) {
            self.skip(cursor, path, SkipReason::StagingArea);
            return None;
        }

        let size = match self.stat.size(&path) {
            Ok(size) => size,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} vanished before it could be archived", path.display());
                self.skip(cursor, path, SkipReason::Vanished);
                return None;
            }
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                self.skip(cursor, path, SkipReason::Unreadable(e.to_string()));
                return None;
            }
        };

        let relative = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(&entry.file_name));
        Some(CandidateFile::new(path, size, relative))
    }

    /// Place one candidate, sealing the open archive first if it is full
    fn admit<F>(&self, cursor: &mut Cursor, candidate: &CandidateFile, emit: &mut F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let full = cursor.current.as_ref().is_some_and(|archive| {
            archive.member_count() > 0 && self.builder.would_exceed(archive, candidate.size)
        });
        if full {
            self.seal_current(cursor, emit)?;
        }

        let mut archive = match cursor.current.take() {
            Some(archive) => archive,
            None => self.open_next(cursor)?,
        };

        match self.builder.add(&mut archive, candidate) {
            Ok(()) => {
                if candidate.size > self.builder.bound() {
                    warn!(
                        "{} is {} bytes, over the {} byte bound; archiving it alone",
                        candidate.path.display(),
                        candidate.size,
                        self.builder.bound()
                    );
                }
                cursor.current = Some(archive);
                Ok(())
            }
            Err(CapsuleError::NotFound(path)) => {
                warn!("{} vanished before it could be archived", path.display());
                cursor.current = Some(archive);
                self.skip(cursor, path, SkipReason::Vanished);
                Ok(())
            }
            Err(
                e @ CapsuleError::Storage {
                    op: StorageOp::ReadSource,
                    ..
                },
            ) => {
                warn!("{}; rebuilding archive #{}", e, archive.sequence());
                self.skip(cursor, candidate.path.clone(), SkipReason::Unreadable(e.to_string()));
                let fresh = self.restage(cursor, archive)?;
                cursor.current = Some(fresh);
                Ok(())
            }
            // opening the source failed, the archive is untouched
            Err(e) if !e.is_fatal() => {
                warn!("{}", e);
                cursor.current = Some(archive);
                self.skip(cursor, candidate.path.clone(), SkipReason::Unreadable(e.to_string()));
                Ok(())
            }
            Err(e) => {
                self.abandon(cursor, archive, &e);
                Err(e)
            }
        }
    }

    /// Replace an archive left indeterminate by a failed copy.
    ///
    /// The broken artifact is removed and every earlier member is copied
    /// into a fresh archive under the next sequence number.
    fn restage(&self, cursor: &mut Cursor, broken: Archive) -> Result<Archive> {
        let members = broken.members().to_vec();
        let sequence = broken.sequence();
        let path = broken.path().to_path_buf();

        self.builder.discard(broken)?;
        cursor.summary.archives_discarded += 1;
        self.publisher.on_discard(
            sequence,
            path,
            format!("source read failed, re-staging {} members", members.len()),
        );

        let mut fresh = self.open_next(cursor)?;
        for member in &members {
            if let Err(e) = self.builder.add(&mut fresh, member) {
                let e = CapsuleError::InvalidState(format!(
                    "cannot re-stage {} into archive #{}: {}",
                    member.path.display(),
                    fresh.sequence(),
                    e
                ));
                self.abandon(cursor, fresh, &e);
                return Err(e);
            }
        }
        Ok(fresh)
    }

    /// Seal the open archive and hand it to `emit`
    fn seal_current<F>(&self, cursor: &mut Cursor, emit: &mut F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let Some(mut archive) = cursor.current.take() else {
            return Ok(());
        };

        if archive.member_count() == 0 {
            let sequence = archive.sequence();
            let path = archive.path().to_path_buf();
            self.builder.discard(archive)?;
            cursor.summary.archives_discarded += 1;
            debug!("Discarded empty archive #{}", sequence);
            self.publisher
                .on_discard(sequence, path, "no readable members".to_string());
            return Ok(());
        }

        if let Err(e) = self.builder.seal(&mut archive) {
            self.abandon(cursor, archive, &e);
            return Err(e);
        }

        let oversize = archive.member_count() == 1 && archive.total_size() > self.builder.bound();
        let batch = Batch::from_sealed(archive)?;

        self.publisher.on_seal(
            batch.sequence(),
            batch.archive_path().to_path_buf(),
            batch.members().len(),
            batch.total_size(),
            batch.compressed_size(),
            oversize,
        );

        let summary = &mut cursor.summary;
        summary.batches_sealed += 1;
        summary.files_archived += batch.members().len() as u64;
        summary.bytes_archived += batch.total_size();
        if oversize {
            summary.oversize_batches += 1;
        }

        emit(batch)
    }

    /// Seal whatever is still open once traversal is exhausted
    fn finish<F>(&self, cursor: &mut Cursor, emit: &mut F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        self.seal_current(cursor, emit)
    }

    fn open_next(&self, cursor: &mut Cursor) -> Result<Archive> {
        let sequence = cursor.next_sequence;
        let archive = self.builder.open(sequence)?;
        cursor.next_sequence += 1;
        self.publisher.on_open(sequence, archive.path().to_path_buf());
        Ok(archive)
    }

    /// Drop a broken archive on the way out of a fatal error
    fn abandon(&self, cursor: &mut Cursor, archive: Archive, cause: &CapsuleError) {
        let sequence = archive.sequence();
        let path = archive.path().to_path_buf();
        if let Err(e) = self.builder.discard(archive) {
            warn!("Could not remove broken archive {}: {}", path.display(), e);
        }
        cursor.summary.archives_discarded += 1;
        self.publisher.on_discard(sequence, path, cause.to_string());
    }

    fn skip(&self, cursor: &mut Cursor, path: PathBuf, reason: SkipReason) {
        cursor.summary.files_skipped += 1;
        self.publisher.on_skip(path, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::PackEvent;
    use std::collections::HashSet;
    use std::io;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, size: usize) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'x'; size]).unwrap();
        path
    }

    fn planner(temp: &TempDir, config: PackConfig) -> BatchPlanner<WalkDirWalker, FsStat> {
        let config = config.with_staging_dir(temp.path().join("staging"));
        BatchPlanner::new(&config, "plan").with_walker(WalkDirWalker::sorted())
    }

    fn collect(planner: &BatchPlanner<impl DirectoryWalker, impl FileStat>, root: &Path) -> (Vec<Batch>, PlanSummary) {
        let mut batches = Vec::new();
        let summary = planner
            .plan(root, |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        (batches, summary)
    }

    fn member_names(batch: &Batch) -> Vec<String> {
        batch.members().iter().map(|m| m.archive_name()).collect()
    }

    #[test]
    fn test_four_equal_files_split_three_and_one() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        for name in ["f1", "f2", "f3", "f4"] {
            write(&root, name, 100);
        }

        let p = planner(&temp, PackConfig::with_bound(350));
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 2);
        assert_eq!(member_names(&batches[0]), vec!["f1", "f2", "f3"]);
        assert_eq!(member_names(&batches[1]), vec!["f4"]);
        assert_eq!(batches[0].total_size(), 300);
        assert_eq!(summary.batches_sealed, 2);
        assert_eq!(summary.files_archived, 4);
        assert_eq!(summary.bytes_archived, 400);
        assert_eq!(summary.oversize_batches, 0);
    }

    #[test]
    fn test_oversize_file_is_isolated() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a_small", 10);
        write(&root, "b_huge", 500);
        write(&root, "c_small", 10);

        let (publisher, subscriber) = EventPublisher::unbounded();
        let p = planner(&temp, PackConfig::with_bound(350)).with_publisher(publisher);
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 3);
        assert_eq!(member_names(&batches[1]), vec!["b_huge"]);
        assert_eq!(summary.oversize_batches, 1);

        let flags: Vec<bool> = subscriber
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                PackEvent::ArchiveSealed { oversize, .. } => Some(oversize),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn test_single_oversize_file_alone() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "big.bin", 500);

        let p = planner(&temp, PackConfig::with_bound(350));
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].total_size(), 500);
        assert_eq!(summary.oversize_batches, 1);
    }

    #[test]
    fn test_excluded_files_are_never_staged() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a.txt", 5);
        write(&root, "b.log", 5);

        let (publisher, subscriber) = EventPublisher::unbounded();
        let p = planner(&temp, PackConfig::with_bound(100).with_exclusions(["*.log"]))
            .with_publisher(publisher);
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 1);
        assert_eq!(member_names(&batches[0]), vec!["a.txt"]);
        assert_eq!(summary.files_skipped, 1);

        let skipped: Vec<SkipReason> = subscriber
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                PackEvent::CandidateSkipped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            skipped,
            vec![SkipReason::Excluded {
                pattern: "*.log".to_string()
            }]
        );
    }

    #[test]
    fn test_every_file_in_exactly_one_batch_within_bound() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        let sizes = [7, 120, 33, 64, 64, 1, 99, 250, 18, 42, 77, 5];
        let mut expected = HashSet::new();
        for (i, size) in sizes.iter().enumerate() {
            let rel = format!("d{}/file{:02}", i % 3, i);
            write(&root, &rel, *size);
            expected.insert(rel);
        }

        let p = planner(&temp, PackConfig::with_bound(256));
        let (batches, _) = collect(&p, &root);

        let mut seen = HashSet::new();
        for batch in &batches {
            assert!(batch.total_size() <= 256);
            for name in member_names(batch) {
                assert!(seen.insert(name), "file placed twice");
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_empty_tree_emits_nothing() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir_all(&root).unwrap();

        let p = planner(&temp, PackConfig::with_bound(10));
        let (batches, summary) = collect(&p, &root);
        assert!(batches.is_empty());
        assert_eq!(summary, PlanSummary::default());
    }

    #[test]
    fn test_staging_inside_root_is_skipped() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a.txt", 5);
        write(&root, "staging/leftover.zip", 5);

        let config = PackConfig::with_bound(100).with_staging_dir(root.join("staging"));
        let p = BatchPlanner::new(&config, "plan").with_walker(WalkDirWalker::sorted());
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 1);
        assert_eq!(member_names(&batches[0]), vec!["a.txt"]);
        // the leftover and the archive opened for a.txt
        assert_eq!(summary.files_skipped, 2);
    }

    struct FlakyStat {
        vanished: PathBuf,
    }

    impl FileStat for FlakyStat {
        fn size(&self, path: &Path) -> io::Result<u64> {
            if path.ends_with(&self.vanished) {
                Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            } else {
                FsStat.size(path)
            }
        }
    }

    #[test]
    fn test_vanished_file_is_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a.txt", 5);
        write(&root, "b.txt", 5);

        let p = planner(&temp, PackConfig::with_bound(100)).with_stat(FlakyStat {
            vanished: PathBuf::from("a.txt"),
        });
        let (batches, summary) = collect(&p, &root);

        assert_eq!(member_names(&batches[0]), vec!["b.txt"]);
        assert_eq!(summary.files_skipped, 1);
    }

    #[test]
    fn test_archive_with_no_readable_members_is_discarded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a.txt", 5);

        // stat succeeds for a file the archive builder can no longer open
        struct PhantomWalker(PathBuf);
        impl DirectoryWalker for PhantomWalker {
            fn walk<'a>(
                &'a self,
                _root: &Path,
            ) -> Box<dyn Iterator<Item = io::Result<WalkEntry>> + 'a> {
                Box::new(std::iter::once(Ok(WalkEntry {
                    directory: self.0.clone(),
                    file_name: "ghost.txt".into(),
                })))
            }
        }
        struct FixedStat;
        impl FileStat for FixedStat {
            fn size(&self, _path: &Path) -> io::Result<u64> {
                Ok(5)
            }
        }

        let p = planner(&temp, PackConfig::with_bound(100))
            .with_walker(PhantomWalker(fs::canonicalize(&root).unwrap()))
            .with_stat(FixedStat);
        let (batches, summary) = collect(&p, &root);

        assert!(batches.is_empty());
        assert_eq!(summary.archives_discarded, 1);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(fs::read_dir(temp.path().join("staging")).unwrap().count(), 0);
    }

    /// Yields fixed names under one directory, in order
    struct ListWalker {
        directory: PathBuf,
        names: Vec<&'static str>,
    }

    impl DirectoryWalker for ListWalker {
        fn walk<'a>(&'a self, _root: &Path) -> Box<dyn Iterator<Item = io::Result<WalkEntry>> + 'a> {
            Box::new(self.names.iter().map(|name| {
                Ok(WalkEntry {
                    directory: self.directory.clone(),
                    file_name: (*name).into(),
                })
            }))
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_read_failure_mid_copy_restages_earlier_members() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "a.txt", 5);
        write(&root, "b.txt", 5);
        // opens fine, but reading a directory fails
        fs::create_dir_all(root.join("adir")).unwrap();

        struct FixedStat;
        impl FileStat for FixedStat {
            fn size(&self, _path: &Path) -> io::Result<u64> {
                Ok(5)
            }
        }

        let (publisher, subscriber) = EventPublisher::unbounded();
        let p = planner(&temp, PackConfig::with_bound(100))
            .with_walker(ListWalker {
                directory: fs::canonicalize(&root).unwrap(),
                names: vec!["a.txt", "adir", "b.txt"],
            })
            .with_stat(FixedStat)
            .with_publisher(publisher);
        let (batches, summary) = collect(&p, &root);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sequence(), 2);
        assert_eq!(member_names(&batches[0]), vec!["a.txt", "b.txt"]);
        assert_eq!(summary.archives_discarded, 1);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_archived, 2);

        let events = subscriber.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            PackEvent::ArchiveDiscarded { sequence: 1, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PackEvent::CandidateSkipped { path, reason: SkipReason::Unreadable(_), .. }
                if path.ends_with("adir")
        )));

        let staged: Vec<String> = fs::read_dir(temp.path().join("staging"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].ends_with("-0002.zip"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_link_is_archived_directory_link_reported() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        write(&root, "real.txt", 5);
        write(temp.path(), "outside.txt", 7);
        fs::create_dir_all(temp.path().join("elsewhere")).unwrap();
        symlink(temp.path().join("outside.txt"), root.join("link.txt")).unwrap();
        symlink(temp.path().join("elsewhere"), root.join("dirlink")).unwrap();

        let (publisher, subscriber) = EventPublisher::unbounded();
        let p = planner(&temp, PackConfig::with_bound(100)).with_publisher(publisher);
        let (batches, summary) = collect(&p, &root);

        assert_eq!(member_names(&batches[0]), vec!["link.txt", "real.txt"]);
        assert_eq!(batches[0].total_size(), 12);
        assert_eq!(summary.files_skipped, 1);
        assert!(subscriber.drain().iter().any(|e| matches!(
            e,
            PackEvent::CandidateSkipped { reason: SkipReason::WalkError(msg), .. }
                if msg.contains("dirlink")
        )));
    }

    #[test]
    fn test_emit_error_stops_planning() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        for name in ["f1", "f2", "f3"] {
            write(&root, name, 100);
        }

        let p = planner(&temp, PackConfig::with_bound(100));
        let mut calls = 0;
        let result = p.plan(&root, |_| {
            calls += 1;
            Err(CapsuleError::InvalidState("stop".to_string()))
        });

        assert!(matches!(result, Err(CapsuleError::InvalidState(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_missing_root_is_not_found() {
        let temp = TempDir::new().unwrap();
        let p = planner(&temp, PackConfig::with_bound(100));
        let result = p.plan(&temp.path().join("nope"), |_| Ok(()));
        assert!(matches!(result, Err(CapsuleError::NotFound(_))));
    }
}
