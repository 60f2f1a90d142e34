/*!
 * Directory traversal and file stat collaborators
 *
 * The planner only needs a lazy stream of `(directory, file_name)` pairs and
 * a way to size a file. Both sit behind traits so tests can pin the order.
 */

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A file discovered during traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub directory: PathBuf,
    pub file_name: OsString,
}

impl WalkEntry {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

/// Yields every regular file below a root, one pass, not restartable
pub trait DirectoryWalker {
    fn walk<'a>(&'a self, root: &Path) -> Box<dyn Iterator<Item = io::Result<WalkEntry>> + 'a>;
}

/// Sizes a file between discovery and archiving
pub trait FileStat {
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// `walkdir`-backed walker. Directory links are not followed.
#[derive(Debug, Clone, Default)]
pub struct WalkDirWalker {
    sort_by_name: bool,
}

impl WalkDirWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visit entries in file-name order for a deterministic traversal
    pub fn sorted() -> Self {
        Self { sort_by_name: true }
    }
}

impl DirectoryWalker for WalkDirWalker {
    fn walk<'a>(&'a self, root: &Path) -> Box<dyn Iterator<Item = io::Result<WalkEntry>> + 'a> {
        let mut walker = WalkDir::new(root).follow_links(false);
        if self.sort_by_name {
            walker = walker.sort_by_file_name();
        }

        let iter = walker.into_iter().filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(walk_entry(&entry))),
            Ok(entry) if entry.file_type().is_symlink() => symlink_entry(&entry),
            Ok(_) => None,
            Err(e) => Some(Err(io::Error::from(e))),
        });

        Box::new(iter)
    }
}

fn walk_entry(entry: &walkdir::DirEntry) -> WalkEntry {
    let directory = entry
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    WalkEntry {
        directory,
        file_name: entry.file_name().to_os_string(),
    }
}

/// A link to a file is archived through its target. A dangling link is
/// still yielded so the stat step reports it. Directory links are never
/// descended and come back as an error.
fn symlink_entry(entry: &walkdir::DirEntry) -> Option<io::Result<WalkEntry>> {
    match fs::metadata(entry.path()) {
        Ok(meta) if meta.is_dir() => Some(Err(io::Error::other(format!(
            "not following directory link {}",
            entry.path().display()
        )))),
        Ok(meta) if !meta.is_file() => Some(Err(io::Error::other(format!(
            "link {} does not point to a regular file",
            entry.path().display()
        )))),
        _ => Some(Ok(walk_entry(entry))),
    }
}

/// Stat through the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat;

impl FileStat for FsStat {
    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}
