//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How a [`FileBackend`] opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, reads only. Used for the source of a repair.
    ReadOnly,
    /// Read and write, creating the file if missing.
    ReadWrite,
}

/// A file-based storage backend.
///
/// The size is queried from the file on every call, so a read-only
/// backend observes growth made by another writer (for example a live
/// WAL being appended to while a backup crawls it).
///
/// # Thread Safety
///
/// The file handle is behind a mutex; positioned reads seek and read
/// under that lock.
///
/// # Example
///
/// ```no_run
/// use reviver_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open_read_only(Path::new("app.db")).unwrap();
/// let header = backend.read_at(0, 100).unwrap();
/// assert_eq!(&header[..16], b"SQLite format 3\0");
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    mode: OpenMode,
    file: Mutex<File>,
}

impl FileBackend {
    /// Opens or creates a file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            mode: OpenMode::ReadWrite,
            file: Mutex::new(file),
        })
    }

    /// Opens an existing file for reading only.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist, or an
    /// I/O error if it cannot be opened.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            mode: OpenMode::ReadOnly,
            file: Mutex::new(file),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mode the file was opened with.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        match self.mode {
            OpenMode::ReadOnly => Err(StorageError::ReadOnly),
            OpenMode::ReadWrite => Ok(()),
        }
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.read_up_to(offset, len)?;
        if data.len() < len {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.size()?,
            });
        }
        Ok(data)
    }

    fn read_up_to(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX).min(len);

        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; available];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        let file = self.file.lock();
        let size = file.metadata()?.len();

        if new_size > size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, size
                ),
            )));
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.mode(), OpenMode::ReadWrite);
        assert!(path.exists());
    }

    #[test]
    fn file_write_at_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello").unwrap();
        backend.write_at(5, b" world").unwrap();
        backend.write_at(0, b"J").unwrap();

        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(&backend.read_at(0, 11).unwrap(), b"Jello world");
    }

    #[test]
    fn file_write_past_end_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(8, b"xy").unwrap();

        assert_eq!(backend.read_at(0, 10).unwrap(), [0, 0, 0, 0, 0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { size: 5, .. })));
        assert!(result.unwrap_err().is_short_read());
    }

    #[test]
    fn file_read_up_to_returns_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello").unwrap();

        assert_eq!(backend.read_up_to(3, 100).unwrap(), b"lo".to_vec());
        assert!(backend.read_up_to(99, 4).unwrap().is_empty());
    }

    #[test]
    fn file_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::fs::write(&path, b"frozen").unwrap();

        let mut backend = FileBackend::open_read_only(&path).unwrap();
        assert_eq!(&backend.read_at(0, 6).unwrap(), b"frozen");
        assert!(matches!(backend.write_at(0, b"x"), Err(StorageError::ReadOnly)));
        assert!(matches!(backend.truncate(0), Err(StorageError::ReadOnly)));
        assert!(backend.sync().is_ok());
    }

    #[test]
    fn file_read_only_missing() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_read_only(&dir.path().join("absent.db"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn file_read_only_sees_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db-wal");

        let mut writer = FileBackend::open(&path).unwrap();
        let reader = FileBackend::open_read_only(&path).unwrap();
        assert_eq!(reader.size().unwrap(), 0);

        writer.write_at(0, b"frame").unwrap();
        writer.sync().unwrap();
        assert_eq!(reader.size().unwrap(), 5);
    }

    #[test]
    fn file_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello world").unwrap();
        backend.truncate(5).unwrap();

        assert_eq!(backend.size().unwrap(), 5);
        assert!(backend.truncate(6).is_err());
    }
}
