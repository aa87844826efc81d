use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-addressed backing storage of a log.
/// Reads past the end are short, writes past the end extend it.
pub trait LogStorage: Send + Sync {
    /// Read bytes at given offset, returns number of bytes read.
    /// Result is shorter than buffer only if end of storage is reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all bytes at given offset.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Returns current length of storage.
    fn len(&self) -> u64;

    /// Returns whether storage is empty.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate storage to given length.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Persist all written data.
    fn sync(&self) -> Result<()>;
}

/// In-memory storage, mostly used in tests and for
/// temporary stores.
#[derive(Default)]
pub struct MemLogStorage {
    data: RwLock<Vec<u8>>,
}

impl MemLogStorage {
    #[inline]
    pub fn new() -> Self {
        MemLogStorage::default()
    }

    /// Returns a copy of all bytes.
    #[inline]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogStorage for MemLogStorage {
    #[inline]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    #[inline]
    fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    #[inline]
    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    #[inline]
    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().truncate(len as usize);
        Ok(())
    }

    #[inline]
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage backed by a single file using positional IO.
pub struct FileLogStorage {
    file: File,
    len: AtomicU64,
}

impl FileLogStorage {
    /// Open or create log file at given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(FileLogStorage {
            file,
            len: AtomicU64::new(len),
        })
    }
}

impl LogStorage for FileLogStorage {
    #[inline]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(done)
    }

    #[inline]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        self.len
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    #[inline]
    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_storage(storage: &dyn LogStorage) {
        assert!(storage.is_empty());
        storage.write_at(4, b"abcd").unwrap();
        assert_eq!(storage.len(), 8);
        let mut buf = [0xffu8; 16];
        let n = storage.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], &[0, 0, 0, 0, b'a', b'b', b'c', b'd']);
        assert_eq!(storage.read_at(100, &mut buf).unwrap(), 0);
        storage.truncate(6).unwrap();
        assert_eq!(storage.len(), 6);
        storage.sync().unwrap();
    }

    #[test]
    fn test_mem_log_storage() {
        let storage = MemLogStorage::new();
        check_storage(&storage);
        assert_eq!(storage.snapshot(), vec![0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_file_log_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodedb.log");
        {
            let storage = FileLogStorage::open(&path).unwrap();
            check_storage(&storage);
        }
        let storage = FileLogStorage::open(&path).unwrap();
        assert_eq!(storage.len(), 6);
    }
}
