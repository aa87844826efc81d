//! Append-only log of typed loggables.
//!
//! The log is a sequence of fixed-size pages. Each page optionally
//! ends with an 8-byte hash of its content, and its content is
//! optionally encrypted by a stream cipher. Loggables are 8-byte
//! aligned and never cross segment boundary.
pub mod cipher;
pub mod loggable;
pub mod reader;
pub mod storage;
mod writer;

use crate::conf::LogConfig;
use crate::error::{Error, Result};
use crate::journal::cipher::{Blake3CipherProvider, CipherContext, StreamCipherProvider};
use crate::journal::loggable::{
    Loggable, LoggableIterator, LoggableType, NULL_LOGGABLE_SIZE, PAGE_HASH_SIZE,
};
use crate::journal::reader::PagedLogReader;
use crate::journal::storage::LogStorage;
use crate::journal::writer::LogWriter;
use ::log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

/// Physical layout of log pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFormat {
    pub page_size: usize,
    /// Data bytes of a full page, trailer excluded.
    pub chunk_size: usize,
    pub hash_code: bool,
    pub check_pages: bool,
}

impl PageFormat {
    #[inline]
    pub fn new(config: &LogConfig) -> Self {
        let page_size = config.page_size_usize();
        let chunk_size = if config.hash_code {
            page_size - PAGE_HASH_SIZE
        } else {
            page_size
        };
        PageFormat {
            page_size,
            chunk_size,
            hash_code: config.hash_code,
            check_pages: config.check_pages,
        }
    }
}

/// Where a page was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    /// Raw page from storage, may be encrypted and need verification.
    Storage,
    /// Plain bytes of the in-memory tail page.
    WriteBuffer,
}

/// Source of log pages for [`PagedLogReader`].
pub trait LogPages {
    fn page_format(&self) -> &PageFormat;

    fn cipher(&self) -> Option<&CipherContext>;

    /// Load page at given page-aligned address into buffer.
    /// Buffer is shorter than page size only at the end of log.
    fn read_page(&self, page_address: u64, buf: &mut Vec<u8>) -> Result<PageOrigin>;

    /// Upper bound of readable addresses.
    fn file_length_bound(&self) -> u64;

    #[inline]
    fn cache_page_size(&self) -> usize {
        self.page_format().page_size
    }
}

/// Pages read directly from storage, without any write buffer.
pub struct RawPages<'a> {
    storage: &'a dyn LogStorage,
    format: PageFormat,
    cipher: Option<&'a CipherContext>,
}

impl<'a> RawPages<'a> {
    #[inline]
    pub fn new(
        storage: &'a dyn LogStorage,
        format: PageFormat,
        cipher: Option<&'a CipherContext>,
    ) -> Self {
        RawPages {
            storage,
            format,
            cipher,
        }
    }
}

#[inline]
fn read_storage_page(
    storage: &dyn LogStorage,
    page_size: usize,
    page_address: u64,
    buf: &mut Vec<u8>,
) -> Result<PageOrigin> {
    buf.clear();
    buf.resize(page_size, 0);
    let n = storage.read_at(page_address, buf)?;
    buf.truncate(n);
    Ok(PageOrigin::Storage)
}

impl LogPages for RawPages<'_> {
    #[inline]
    fn page_format(&self) -> &PageFormat {
        &self.format
    }

    #[inline]
    fn cipher(&self) -> Option<&CipherContext> {
        self.cipher
    }

    #[inline]
    fn read_page(&self, page_address: u64, buf: &mut Vec<u8>) -> Result<PageOrigin> {
        read_storage_page(self.storage, self.format.page_size, page_address, buf)
    }

    #[inline]
    fn file_length_bound(&self) -> u64 {
        self.storage.len()
    }
}

/// Log opened for reading and appending.
pub struct Log {
    config: LogConfig,
    format: PageFormat,
    storage: Arc<dyn LogStorage>,
    cipher: Option<CipherContext>,
    writer: Mutex<LogWriter>,
}

impl Log {
    /// Open log on given storage, encryption uses BLAKE3 keystream.
    #[inline]
    pub fn open(storage: Arc<dyn LogStorage>, config: LogConfig) -> Result<Self> {
        Self::open_with_cipher_provider(storage, config, Arc::new(Blake3CipherProvider))
    }

    /// Open log with custom cipher provider.
    /// Damaged tail of the log is cut off at the last valid
    /// checkpoint, and will be overwritten by next flush.
    pub fn open_with_cipher_provider(
        storage: Arc<dyn LogStorage>,
        config: LogConfig,
        provider: Arc<dyn StreamCipherProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let format = PageFormat::new(&config);
        let cipher = config
            .cipher_key_bytes()?
            .map(|key| CipherContext::new(provider, key, config.cipher_basic_iv, config.cipher_alignment));
        let mut writer = LogWriter::new(format, config.segment_size_u64());
        let len = storage.len();
        if len == 0 {
            // address 0 is reserved, so every loggable has positive address.
            writer.write_zeros(&*storage, cipher.as_ref(), NULL_LOGGABLE_SIZE)?;
        } else {
            let page_size = format.page_size as u64;
            let page_address = (len - 1) / page_size * page_size;
            let raw = RawPages::new(&*storage, format, cipher.as_ref());
            let mut reader = PagedLogReader::new(&raw, page_address);
            let valid = reader.current_page()?;
            if valid.len() == format.chunk_size {
                writer.resume(page_address + page_size, &[]);
            } else {
                writer.resume(page_address, valid);
            }
            if let Some(end) = reader.truncated_end() {
                info!("log tail recovered, valid data ends at {end}, storage length {len}");
            }
        }
        debug!(
            "log opened: page size {}, high address {}",
            format.page_size,
            writer.high_address()
        );
        Ok(Log {
            config,
            format,
            storage,
            cipher,
            writer: Mutex::new(writer),
        })
    }

    #[inline]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    #[inline]
    pub fn segment_size(&self) -> u64 {
        self.config.segment_size_u64()
    }

    /// Address where next loggable would start, ignoring
    /// segment padding.
    #[inline]
    pub fn high_address(&self) -> u64 {
        self.writer.lock().high_address()
    }

    /// Append a loggable and returns its address.
    #[inline]
    pub fn append(&self, ty: LoggableType, structure_id: i32, data: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        writer.append(&*self.storage, self.cipher.as_ref(), ty, structure_id, data)
    }

    /// Persist all appended loggables.
    #[inline]
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush(&*self.storage, self.cipher.as_ref())
    }

    /// Read the loggable at given address.
    #[inline]
    pub fn read(&self, address: u64) -> Result<Loggable> {
        if address == 0 || address % 8 != 0 {
            return Err(Error::InvalidArgument);
        }
        let mut reader = PagedLogReader::new(self, address);
        Loggable::read(&mut reader)
    }

    /// Iterate loggables from given address to current end of log.
    #[inline]
    pub fn loggables(&self, start: u64) -> LoggableIterator<'_, Log> {
        LoggableIterator::new(PagedLogReader::new(self, start))
    }

    /// Create a byte reader at given address.
    #[inline]
    pub fn reader(&self, start: u64) -> PagedLogReader<'_, Log> {
        PagedLogReader::new(self, start)
    }
}

impl LogPages for Log {
    #[inline]
    fn page_format(&self) -> &PageFormat {
        &self.format
    }

    #[inline]
    fn cipher(&self) -> Option<&CipherContext> {
        self.cipher.as_ref()
    }

    #[inline]
    fn read_page(&self, page_address: u64, buf: &mut Vec<u8>) -> Result<PageOrigin> {
        let writer = self.writer.lock();
        if page_address == writer.page_address {
            buf.clear();
            buf.extend_from_slice(&writer.page);
            return Ok(PageOrigin::WriteBuffer);
        }
        if page_address > writer.page_address {
            buf.clear();
            return Ok(PageOrigin::Storage);
        }
        read_storage_page(&*self.storage, self.format.page_size, page_address, buf)
    }

    #[inline]
    fn file_length_bound(&self) -> u64 {
        self.writer.lock().high_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::CIPHER_KEY_LEN;
    use crate::journal::loggable::LOGGABLE_HEADER_SIZE;
    use crate::journal::storage::MemLogStorage;

    fn small_config() -> LogConfig {
        LogConfig::default().page_size(256u64).segment_size(1024u64)
    }

    fn payload(i: u32, len: usize) -> Vec<u8> {
        (0..len).map(|j| (i as usize * 31 + j) as u8).collect()
    }

    #[test]
    fn test_log_append_read() {
        let storage = Arc::new(MemLogStorage::new());
        let log = Log::open(storage.clone(), small_config()).unwrap();
        let mut addrs = vec![];
        for i in 0..40u32 {
            let data = payload(i, (i as usize * 7) % 90);
            addrs.push(log.append(0x15, i as i32, &data).unwrap());
        }
        assert_eq!(addrs[0], 8);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(addr % 8, 0);
            let loggable = log.read(*addr).unwrap();
            assert_eq!(loggable.ty, 0x15);
            assert_eq!(loggable.structure_id, i as i32);
            assert_eq!(&loggable.data()[..], &payload(i as u32, (i * 7) % 90)[..]);
        }
        // iteration skips padding.
        let all: Vec<_> = log.loggables(8).map(|l| l.unwrap().address).collect();
        assert_eq!(all, addrs);
        assert_eq!(log.read(0).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_log_segment_boundary() {
        let storage = Arc::new(MemLogStorage::new());
        let log = Log::open(storage, small_config()).unwrap();
        // each segment holds 4 chunks of 248 bytes.
        let capacity = 4 * 248;
        let too_big = vec![1u8; capacity - LOGGABLE_HEADER_SIZE + 1];
        assert_eq!(log.append(0x15, 1, &too_big), Err(Error::TooBigLoggable));
        let first = log.append(0x15, 1, &[2u8; 500]).unwrap();
        let second = log.append(0x15, 1, &[3u8; 500]).unwrap();
        assert!(first < 1024);
        assert_eq!(second, 1024);
        let fits = log.append(0x15, 1, &vec![4u8; capacity - LOGGABLE_HEADER_SIZE - 520]).unwrap();
        assert!(fits < 2048);
        let all: Vec<_> = log.loggables(8).map(|l| l.unwrap().address).collect();
        assert_eq!(all, vec![first, second, fits]);
    }

    #[test]
    fn test_log_reopen() {
        let storage = Arc::new(MemLogStorage::new());
        let mut addrs = vec![];
        {
            let log = Log::open(storage.clone(), small_config()).unwrap();
            for i in 0..20u32 {
                addrs.push(log.append(0x14, 3, &payload(i, 33)).unwrap());
            }
            log.flush().unwrap();
        }
        let log = Log::open(storage.clone(), small_config()).unwrap();
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(&log.read(*addr).unwrap().data()[..], &payload(i as u32, 33)[..]);
        }
        // continue appending after reopen.
        let addr = log.append(0x14, 3, b"tail").unwrap();
        log.flush().unwrap();
        let log = Log::open(storage, small_config()).unwrap();
        assert_eq!(&log.read(addr).unwrap().data()[..], b"tail");
        assert_eq!(log.loggables(8).count(), addrs.len() + 1);
    }

    #[test]
    fn test_log_encrypted() {
        let key = [9u8; CIPHER_KEY_LEN];
        let config = small_config().cipher(&key, 77).cipher_alignment(64);
        let storage = Arc::new(MemLogStorage::new());
        let secret = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let addr;
        {
            let log = Log::open(storage.clone(), config.clone()).unwrap();
            addr = log.append(0x15, 1, &secret).unwrap();
            log.flush().unwrap();
        }
        let raw = storage.snapshot();
        assert!(!raw.windows(16).any(|w| w == &secret[..16]));
        let log = Log::open(storage.clone(), config).unwrap();
        assert_eq!(&log.read(addr).unwrap().data()[..], &secret[..]);
        // wrong key cannot recover the data.
        let wrong = small_config().cipher(&[1u8; CIPHER_KEY_LEN], 77).cipher_alignment(64);
        let log = Log::open(storage, wrong).unwrap();
        match log.read(addr) {
            Ok(loggable) => assert_ne!(&loggable.data()[..], &secret[..]),
            Err(e) => assert!(e.is_corruption() || e == Error::InvalidFormat),
        }
    }

    #[test]
    fn test_log_recover_torn_tail() {
        let storage = Arc::new(MemLogStorage::new());
        let (kept, lost);
        {
            let log = Log::open(storage.clone(), small_config()).unwrap();
            kept = log.append(0x15, 1, &[5u8; 40]).unwrap();
            log.flush().unwrap();
            lost = log.append(0x15, 1, &[6u8; 40]).unwrap();
            log.flush().unwrap();
        }
        // tear the last write by damaging the second record.
        storage.write_at(lost + 20, &[0xee; 4]).unwrap();
        let log = Log::open(storage.clone(), small_config()).unwrap();
        assert_eq!(&log.read(kept).unwrap().data()[..], &[5u8; 40]);
        assert!(log.high_address() <= lost);
        assert!(log.read(lost).unwrap_err().is_corruption());
        let addrs: Vec<_> = log.loggables(8).map(|l| l.unwrap().address).collect();
        assert_eq!(addrs, vec![kept]);
        // next write replaces damaged tail.
        let fresh = log.append(0x15, 1, &[7u8; 40]).unwrap();
        log.flush().unwrap();
        let log = Log::open(storage, small_config()).unwrap();
        assert_eq!(&log.read(fresh).unwrap().data()[..], &[7u8; 40]);
    }

    #[test]
    fn test_paged_reader_damaged_full_page() {
        let storage = Arc::new(MemLogStorage::new());
        let log = Log::open(storage.clone(), small_config()).unwrap();
        let mut addrs = vec![];
        for i in 0..12u32 {
            addrs.push(log.append(0x15, 1, &payload(i, 50)).unwrap());
            if i == 1 {
                log.flush().unwrap();
            }
        }
        log.flush().unwrap();
        let format = *log.page_format();
        // corrupt first page after the checkpoint written by first flush.
        storage.write_at(200, &[0xaa; 8]).unwrap();
        let raw = RawPages::new(&*storage, format, None);
        let mut reader = PagedLogReader::new(&raw, addrs[0]);
        let first = Loggable::read(&mut reader).unwrap();
        assert_eq!(first.address, addrs[0]);
        // first flush wrote its checkpoint right before third record.
        assert_eq!(reader.truncated_end(), Some(addrs[2]));
        let items: Vec<_> = LoggableIterator::new(PagedLogReader::new(&raw, 8)).collect();
        assert_eq!(items.len(), 3);
        let valid: Vec<u64> = items[..2]
            .iter()
            .map(|l| l.as_ref().unwrap().address)
            .collect();
        assert_eq!(valid, addrs[..2].to_vec());
        assert_eq!(
            items[2].as_ref().unwrap_err(),
            &Error::DataCorrupted(addrs[2])
        );
    }
}
