/*!
 * Size-bounded zip archive accumulation
 *
 * An `Archive` is OPEN from `ArchiveBuilder::open` until `ArchiveBuilder::seal`.
 * Only a sealed archive can become a `Batch`, the unit handed to delivery.
 */

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::PackConfig;
use crate::error::{CapsuleError, Result, StorageOp};

/// Entries at or above this size need ZIP64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// A file eligible for archiving
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateFile {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Size in bytes at discovery time
    pub size: u64,
    /// Path relative to the scan root
    pub relative_path: PathBuf,
}

impl CandidateFile {
    pub fn new(path: PathBuf, size: u64, relative_path: PathBuf) -> Self {
        Self {
            path,
            size,
            relative_path,
        }
    }

    /// Entry name inside the container, always `/`-separated
    pub fn archive_name(&self) -> String {
        self.relative_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Open,
    Sealed,
}

/// Mutable accumulator backed by a zip file in the staging directory
pub struct Archive {
    sequence: u32,
    path: PathBuf,
    state: ArchiveState,
    total_size: u64,
    compressed_size: u64,
    members: Vec<CandidateFile>,
    writer: Option<ZipWriter<BufWriter<File>>>,
}

impl Archive {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    /// Cumulative uncompressed size of all members
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[CandidateFile] {
        &self.members
    }

    pub fn is_sealed(&self) -> bool {
        self.state == ArchiveState::Sealed
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("sequence", &self.sequence)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("total_size", &self.total_size)
            .field("members", &self.members.len())
            .finish()
    }
}

/// A sealed archive and its member list, consumed once by delivery
#[derive(Debug, Clone)]
pub struct Batch {
    sequence: u32,
    archive_path: PathBuf,
    total_size: u64,
    compressed_size: u64,
    members: Vec<CandidateFile>,
}

impl Batch {
    /// Take ownership of a sealed archive
    pub fn from_sealed(archive: Archive) -> Result<Self> {
        if !archive.is_sealed() {
            return Err(CapsuleError::InvalidState(format!(
                "archive #{} is still open",
                archive.sequence
            )));
        }
        Ok(Self {
            sequence: archive.sequence,
            archive_path: archive.path,
            total_size: archive.total_size,
            compressed_size: archive.compressed_size,
            members: archive.members,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn members(&self) -> &[CandidateFile] {
        &self.members
    }
}

/// Creates, fills and seals archives in a staging directory
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    staging_dir: PathBuf,
    prefix: String,
    bound: u64,
    compression_level: Option<i64>,
    chunk_size: usize,
}

impl ArchiveBuilder {
    /// `prefix` names every artifact of this run: `<prefix>-<seq:04>.zip`
    pub fn new(config: &PackConfig, prefix: impl Into<String>) -> Self {
        Self {
            staging_dir: config.staging_dir(),
            prefix: prefix.into(),
            bound: config.bound_bytes,
            compression_level: config.compression_level,
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Artifact prefix for a run over `root`: root name plus a UTC timestamp
    pub fn run_prefix(root: &Path) -> String {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "root".to_string());
        format!("{}-{}", name, Utc::now().format("%Y%m%dT%H%M%SZ"))
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn bound(&self) -> u64 {
        self.bound
    }

    pub fn artifact_path(&self, sequence: u32) -> PathBuf {
        self.staging_dir
            .join(format!("{}-{:04}.zip", self.prefix, sequence))
    }

    /// Create a new OPEN archive backed by a fresh artifact
    pub fn open(&self, sequence: u32) -> Result<Archive> {
        fs::create_dir_all(&self.staging_dir)
            .map_err(|e| CapsuleError::storage(StorageOp::CreateArchive, &self.staging_dir, e))?;

        let path = self.artifact_path(sequence);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CapsuleError::storage(StorageOp::CreateArchive, &path, e))?;

        debug!("Opened archive #{} at {}", sequence, path.display());

        Ok(Archive {
            sequence,
            path,
            state: ArchiveState::Open,
            total_size: 0,
            compressed_size: 0,
            members: Vec::new(),
            writer: Some(ZipWriter::new(BufWriter::new(file))),
        })
    }

    /// True when adding `candidate_size` bytes would push the archive past the bound
    pub fn would_exceed(&self, archive: &Archive, candidate_size: u64) -> bool {
        archive.total_size.saturating_add(candidate_size) > self.bound
    }

    /// Stream a candidate into the archive under its relative path.
    ///
    /// A source that cannot be opened leaves the archive untouched
    /// (`NotFound` or `StorageOp::OpenSource`). Any later failure leaves the
    /// archive indeterminate and it must be discarded.
    pub fn add(&self, archive: &mut Archive, candidate: &CandidateFile) -> Result<()> {
        let sequence = archive.sequence;
        let writer = archive.writer.as_mut().ok_or_else(|| {
            CapsuleError::InvalidState(format!("cannot add to sealed archive #{}", sequence))
        })?;

        let mut source = File::open(&candidate.path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CapsuleError::NotFound(candidate.path.clone())
            } else {
                CapsuleError::storage(StorageOp::OpenSource, &candidate.path, e)
            }
        })?;

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(candidate.size >= ZIP64_THRESHOLD);
        if let Some(level) = self.compression_level {
            options = options.compression_level(Some(level));
        }

        writer
            .start_file(candidate.archive_name(), options)
            .map_err(|e| CapsuleError::storage(StorageOp::WriteArchive, &archive.path, zip_io(e)))?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(CapsuleError::storage(
                        StorageOp::ReadSource,
                        &candidate.path,
                        e,
                    ))
                }
            };
            writer
                .write_all(&buffer[..n])
                .map_err(|e| CapsuleError::storage(StorageOp::WriteArchive, &archive.path, e))?;
            copied += n as u64;
        }

        debug!(
            "Added {} ({} bytes) to archive #{}",
            candidate.relative_path.display(),
            copied,
            sequence
        );

        archive.total_size += candidate.size;
        archive.members.push(candidate.clone());
        Ok(())
    }

    /// Flush and close the container. Sealing twice is an `InvalidState` error.
    pub fn seal(&self, archive: &mut Archive) -> Result<()> {
        if archive.is_sealed() {
            return Err(CapsuleError::InvalidState(format!(
                "archive #{} is already sealed",
                archive.sequence
            )));
        }
        let writer = archive.writer.take().ok_or_else(|| {
            CapsuleError::InvalidState(format!("archive #{} has no writer", archive.sequence))
        })?;

        let path = archive.path.clone();
        let finish_err = |e: io::Error| CapsuleError::storage(StorageOp::FinishArchive, &path, e);

        let buffered = writer.finish().map_err(|e| finish_err(zip_io(e)))?;
        let file = buffered.into_inner().map_err(|e| finish_err(e.into_error()))?;
        file.sync_all().map_err(finish_err)?;
        archive.compressed_size = file.metadata().map_err(finish_err)?.len();
        archive.state = ArchiveState::Sealed;

        debug!(
            "Sealed archive #{}: {} members, {} bytes -> {} bytes",
            archive.sequence,
            archive.members.len(),
            archive.total_size,
            archive.compressed_size
        );
        Ok(())
    }

    /// Abandon an archive and remove its artifact
    pub fn discard(&self, mut archive: Archive) -> Result<()> {
        drop(archive.writer.take());
        match fs::remove_file(&archive.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::storage(StorageOp::RemoveFile, &archive.path, e)),
        }
    }
}

fn zip_io(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}
