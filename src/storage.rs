//! On-disk record log.
//!
//! The log is a single append-only file holding the raw concatenation of
//! every record received during one server run. Each operation opens the
//! file, does its I/O and closes it again; nothing holds it open between
//! records. There is no locking: connections are served one at a time, so
//! there is never more than one reader or writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Which side of [`DataStore::copy_to`] failed
#[derive(Debug)]
pub enum CopyError {
    /// Opening or reading the log file.
    Read(io::Error),
    /// Writing to the destination.
    Write(io::Error),
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Read(e) => write!(f, "failed to read data file: {}", e),
            CopyError::Write(e) => write!(f, "failed to send data: {}", e),
        }
    }
}

impl std::error::Error for CopyError {}

/// Append-only record log backed by one file
#[derive(Debug, Clone)]
pub struct DataStore {
    path: PathBuf,
}

impl DataStore {
    /// Create a handle for the log at `path`. The file itself is created
    /// lazily by the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DataStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a complete record to the end of the log.
    pub fn append(&self, record: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record)?;
        trace!(bytes = record.len(), path = %self.path.display(), "Appended record");
        Ok(())
    }

    /// Stream the entire log into `out`, `chunk_size` bytes at a time.
    ///
    /// Returns the number of bytes written. A failure part way through
    /// leaves `out` holding a prefix of the log.
    pub fn copy_to<W: Write>(&self, out: &mut W, chunk_size: usize) -> Result<u64, CopyError> {
        let mut file = File::open(&self.path).map_err(CopyError::Read)?;
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;

        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::Read(e)),
            };
            out.write_all(&chunk[..n]).map_err(CopyError::Write)?;
            total += n as u64;
        }

        Ok(total)
    }

    /// Delete the log file. Returns `false` if there was nothing to delete.
    pub fn remove(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
