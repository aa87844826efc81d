use crate::error::{Error, Result};
use crate::journal::cipher::CipherContext;
use crate::journal::loggable::{
    hash_code_loggable, page_hash, LoggableHeader, LoggableType, HASH_CODE_LOGGABLE_SIZE,
    LOGGABLE_HEADER_SIZE,
};
use crate::journal::storage::LogStorage;
use crate::journal::PageFormat;
use crate::serde::{align8, Ser};

/// Appender of log tail.
///
/// The last incomplete page is kept as plain bytes in memory.
/// Completed pages are encrypted, sealed with trailing hash and
/// written immediately. Flush persists the incomplete page behind
/// a hash code checkpoint.
pub(super) struct LogWriter {
    format: PageFormat,
    segment_size: u64,
    // address of the incomplete page.
    pub(super) page_address: u64,
    // plain bytes of the incomplete page, always shorter than chunk.
    pub(super) page: Vec<u8>,
    // bytes of incomplete page already persisted.
    flushed_len: usize,
}

impl LogWriter {
    #[inline]
    pub(super) fn new(format: PageFormat, segment_size: u64) -> Self {
        LogWriter {
            format,
            segment_size,
            page_address: 0,
            page: Vec::with_capacity(format.chunk_size),
            flushed_len: 0,
        }
    }

    /// Resume writing on the page at given address, with its
    /// valid persisted prefix.
    #[inline]
    pub(super) fn resume(&mut self, page_address: u64, valid: &[u8]) {
        debug_assert!(valid.len() < self.format.chunk_size);
        self.page_address = page_address;
        self.page.clear();
        self.page.extend_from_slice(valid);
        self.flushed_len = valid.len();
    }

    /// Address of next byte to write.
    #[inline]
    pub(super) fn high_address(&self) -> u64 {
        self.page_address + self.page.len() as u64
    }

    /// Number of data bytes that still fit into current segment.
    #[inline]
    fn segment_remaining(&self) -> u64 {
        let page_size = self.format.page_size as u64;
        let chunk_size = self.format.chunk_size as u64;
        let segment_end = (self.page_address / self.segment_size + 1) * self.segment_size;
        let pages_after = (segment_end - self.page_address) / page_size - 1;
        chunk_size - self.page.len() as u64 + pages_after * chunk_size
    }

    /// Data capacity of one segment.
    #[inline]
    fn segment_capacity(&self) -> u64 {
        self.segment_size / self.format.page_size as u64 * self.format.chunk_size as u64
    }

    /// Append a loggable and returns its address.
    pub(super) fn append(
        &mut self,
        storage: &dyn LogStorage,
        cipher: Option<&CipherContext>,
        ty: LoggableType,
        structure_id: i32,
        data: &[u8],
    ) -> Result<u64> {
        let total = (LOGGABLE_HEADER_SIZE + align8(data.len())) as u64;
        if data.len() > u32::MAX as usize || total > self.segment_capacity() {
            return Err(Error::TooBigLoggable);
        }
        let remaining = self.segment_remaining();
        if total > remaining {
            // pad with null loggables to next segment.
            self.write_zeros(storage, cipher, remaining as usize)?;
        }
        let address = self.high_address();
        let header = LoggableHeader {
            ty,
            structure_id,
            data_len: data.len() as u32,
        };
        let mut buf = [0u8; LOGGABLE_HEADER_SIZE];
        header.ser(&mut buf[..], 0);
        self.write(storage, cipher, &buf)?;
        self.write(storage, cipher, data)?;
        self.write_zeros(storage, cipher, align8(data.len()) - data.len())?;
        Ok(address)
    }

    #[inline]
    pub(super) fn write(
        &mut self,
        storage: &dyn LogStorage,
        cipher: Option<&CipherContext>,
        mut data: &[u8],
    ) -> Result<()> {
        while !data.is_empty() {
            let n = (self.format.chunk_size - self.page.len()).min(data.len());
            self.page.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.page.len() == self.format.chunk_size {
                self.write_full_page(storage, cipher)?;
            }
        }
        Ok(())
    }

    #[inline]
    pub(super) fn write_zeros(
        &mut self,
        storage: &dyn LogStorage,
        cipher: Option<&CipherContext>,
        mut len: usize,
    ) -> Result<()> {
        while len > 0 {
            let n = (self.format.chunk_size - self.page.len()).min(len);
            self.page.resize(self.page.len() + n, 0);
            len -= n;
            if self.page.len() == self.format.chunk_size {
                self.write_full_page(storage, cipher)?;
            }
        }
        Ok(())
    }

    fn write_full_page(
        &mut self,
        storage: &dyn LogStorage,
        cipher: Option<&CipherContext>,
    ) -> Result<()> {
        let mut out = Vec::with_capacity(self.format.page_size);
        out.extend_from_slice(&self.page);
        if let Some(cipher) = cipher {
            cipher.crypt(self.page_address, &mut out);
        }
        if self.format.hash_code {
            let hash = page_hash(&out, self.page_address);
            out.extend_from_slice(&hash.to_le_bytes());
        }
        storage.write_at(self.page_address, &out)?;
        self.page_address += self.format.page_size as u64;
        self.page.clear();
        self.flushed_len = 0;
        Ok(())
    }

    /// Persist the incomplete page and sync storage.
    pub(super) fn flush(
        &mut self,
        storage: &dyn LogStorage,
        cipher: Option<&CipherContext>,
    ) -> Result<()> {
        if self.page.len() > self.flushed_len {
            if self.format.hash_code {
                let free = self.format.chunk_size - self.page.len();
                if free < HASH_CODE_LOGGABLE_SIZE {
                    // no room for checkpoint, complete the page with padding.
                    self.write_zeros(storage, cipher, free)?;
                } else {
                    let checkpoint = hash_code_loggable(&self.page, self.page_address);
                    self.write(storage, cipher, &checkpoint)?;
                }
            }
            if !self.page.is_empty() {
                let mut out = self.page.clone();
                if let Some(cipher) = cipher {
                    cipher.crypt(self.page_address, &mut out);
                }
                storage.write_at(self.page_address, &out)?;
                self.flushed_len = self.page.len();
            }
        }
        let high = self.high_address();
        if storage.len() > high {
            storage.truncate(high)?;
        }
        storage.sync()
    }
}
