use crate::error::{Error, Result};
use crate::journal::loggable::{find_valid_page_part, page_hash, PAGE_HASH_SIZE};
use crate::journal::{LogPages, PageOrigin};
use ::log::warn;

/// Sequential reader of log bytes that loads one page at a time,
/// verifies and decrypts it, and hides page trailers from caller.
///
/// If a page fails verification, only its prefix ending with the
/// last valid hash code checkpoint is exposed. Reading beyond that
/// prefix reports corruption.
pub struct PagedLogReader<'a, P: LogPages + ?Sized> {
    pages: &'a P,
    position: u64,
    end: u64,
    page_address: u64,
    // plain bytes of current page, trailer excluded.
    page: Vec<u8>,
    loaded: bool,
    truncated: bool,
}

impl<'a, P: LogPages + ?Sized> PagedLogReader<'a, P> {
    /// Create a reader from start address to the end of log.
    #[inline]
    pub fn new(pages: &'a P, start: u64) -> Self {
        let end = pages.file_length_bound();
        Self::with_end(pages, start, end)
    }

    /// Create a reader over address range [start, end).
    #[inline]
    pub fn with_end(pages: &'a P, start: u64, end: u64) -> Self {
        PagedLogReader {
            pages,
            position: start,
            end,
            page_address: 0,
            page: Vec::with_capacity(pages.cache_page_size()),
            loaded: false,
            truncated: false,
        }
    }

    /// Returns current address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.position
    }

    /// Returns end address, which shrinks if a damaged page is found.
    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Returns end of valid data if a damaged page was found.
    #[inline]
    pub fn truncated_end(&self) -> Option<u64> {
        if self.truncated {
            Some(self.end)
        } else {
            None
        }
    }

    /// Returns whether there is more data to read.
    /// Reaching end of a damaged page is an error.
    #[inline]
    pub fn has_next(&self) -> Result<bool> {
        if self.position < self.end {
            return Ok(true);
        }
        if self.truncated {
            return Err(Error::DataCorrupted(self.position));
        }
        Ok(false)
    }

    /// Returns valid plain bytes of the page containing current
    /// position.
    #[inline]
    pub fn current_page(&mut self) -> Result<&[u8]> {
        self.ensure_page()?;
        Ok(&self.page)
    }

    /// Fill the whole output buffer or fail with corruption.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let chunk_size = self.pages.page_format().chunk_size as u64;
        let mut done = 0;
        while done < out.len() {
            if self.position >= self.end {
                return Err(Error::DataCorrupted(self.position));
            }
            self.ensure_page()?;
            let offset = (self.position - self.page_address) as usize;
            // page might be truncated during load.
            if self.position >= self.end || offset >= self.page.len() {
                return Err(Error::DataCorrupted(self.position));
            }
            let avail = (self.page.len() - offset).min((self.end - self.position) as usize);
            let n = avail.min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.page[offset..offset + n]);
            done += n;
            self.position += n as u64;
            if self.position - self.page_address == chunk_size {
                self.position = self.page_address + self.pages.page_format().page_size as u64;
                self.loaded = false;
            }
        }
        Ok(())
    }

    /// Advance position by given number of data bytes.
    pub fn skip(&mut self, n: u64) {
        let format = self.pages.page_format();
        let page_size = format.page_size as u64;
        let chunk_size = format.chunk_size as u64;
        let mut n = n;
        while n > 0 {
            let page_address = self.position - self.position % page_size;
            let offset = self.position - page_address;
            let step = n.min(chunk_size.saturating_sub(offset));
            if step == 0 {
                // position inside trailer, should never happen.
                self.position = page_address + page_size;
                continue;
            }
            self.position += step;
            n -= step;
            if offset + step == chunk_size {
                self.position = page_address + page_size;
            }
        }
        if self.loaded && self.position - self.position % page_size != self.page_address {
            self.loaded = false;
        }
    }

    #[inline]
    fn ensure_page(&mut self) -> Result<()> {
        let page_size = self.pages.page_format().page_size as u64;
        let page_address = self.position - self.position % page_size;
        if self.loaded && page_address == self.page_address {
            return Ok(());
        }
        self.load_page(page_address)
    }

    fn load_page(&mut self, page_address: u64) -> Result<()> {
        if self.truncated || page_address >= self.end {
            return Err(Error::DataCorrupted(page_address));
        }
        let format = *self.pages.page_format();
        let expected = ((self.end - page_address) as usize).min(format.page_size);
        let origin = self.pages.read_page(page_address, &mut self.page)?;
        if self.page.len() < expected {
            warn!(
                "log page {page_address} has {} bytes, expected {expected}",
                self.page.len()
            );
            return Err(Error::DataCorrupted(page_address));
        }
        self.page.truncate(expected);
        self.page_address = page_address;
        self.loaded = true;
        if origin == PageOrigin::WriteBuffer {
            return Ok(());
        }
        let full = expected == format.page_size;
        if format.check_pages && format.hash_code {
            if !full {
                self.decrypt(expected);
                self.extract_valid_part();
                return Ok(());
            }
            let mut hash = [0u8; PAGE_HASH_SIZE];
            hash.copy_from_slice(&self.page[format.chunk_size..]);
            if u64::from_le_bytes(hash) != page_hash(&self.page[..format.chunk_size], page_address)
            {
                warn!("hash code mismatch of log page {page_address}");
                self.page.truncate(format.chunk_size);
                self.decrypt(format.chunk_size);
                self.extract_valid_part();
                return Ok(());
            }
        }
        if full {
            self.page.truncate(format.chunk_size);
        }
        self.decrypt(self.page.len());
        Ok(())
    }

    #[inline]
    fn decrypt(&mut self, len: usize) {
        if let Some(cipher) = self.pages.cipher() {
            cipher.crypt(self.page_address, &mut self.page[..len]);
        }
    }

    fn extract_valid_part(&mut self) {
        let valid = find_valid_page_part(&self.page, self.page_address);
        if valid == self.page.len() {
            return;
        }
        warn!(
            "log page {} is damaged, {} of {} bytes are valid",
            self.page_address,
            valid,
            self.page.len()
        );
        self.page.truncate(valid);
        self.end = self.page_address + valid as u64;
        self.truncated = true;
    }
}
