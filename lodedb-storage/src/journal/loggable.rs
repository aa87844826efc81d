use crate::buf::{AlignedBuf, ByteView};
use crate::error::{Error, Result};
use crate::journal::reader::PagedLogReader;
use crate::journal::LogPages;
use crate::serde::{align8, Deser, Ser, Serde};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Address of nothing. Real loggables never live at address 0
/// because every log starts with a null word.
pub const NULL_ADDRESS: u64 = u64::MAX;

pub type LoggableType = u8;

/// Eight zero bytes, used as padding.
pub const NULL_LOGGABLE: LoggableType = 0x00;
/// Checkpoint of a partially written page, carries hash of the
/// page prefix before it.
pub const HASH_CODE_LOGGABLE: LoggableType = 0x01;

pub const NULL_LOGGABLE_SIZE: usize = 8;
pub const HASH_CODE_LOGGABLE_SIZE: usize = 16;
pub const LOGGABLE_HEADER_SIZE: usize = 16;
/// Trailing hash of a full page.
pub const PAGE_HASH_SIZE: usize = 8;

/// Hash of page bytes, seeded with page address so that a page
/// copied to another position fails verification.
#[inline]
pub fn page_hash(data: &[u8], page_address: u64) -> u64 {
    xxh3_64_with_seed(data, page_address)
}

/// Fixed 16-byte header in front of loggable data.
/// | type(1) | reserved(3) | structure id(4) | data length(4) | reserved(4) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggableHeader {
    pub ty: LoggableType,
    pub structure_id: i32,
    pub data_len: u32,
}

impl LoggableHeader {
    /// Total bytes occupied in log, including data padding.
    #[inline]
    pub fn total_len(&self) -> usize {
        LOGGABLE_HEADER_SIZE + align8(self.data_len as usize)
    }
}

impl Ser for LoggableHeader {
    #[inline]
    fn ser_len(&self) -> usize {
        LOGGABLE_HEADER_SIZE
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = out.ser_u8(start_idx, self.ty);
        let idx = out.ser_zeros(idx, 3);
        let idx = out.ser_i32(idx, self.structure_id);
        let idx = out.ser_u32(idx, self.data_len);
        out.ser_zeros(idx, 4)
    }
}

impl Deser for LoggableHeader {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, ty) = input.deser_u8(start_idx)?;
        let (idx, _) = input.deser(idx, 3)?;
        let (idx, structure_id) = input.deser_i32(idx)?;
        let (idx, data_len) = input.deser_u32(idx)?;
        let (idx, _) = input.deser(idx, 4)?;
        Ok((
            idx,
            LoggableHeader {
                ty,
                structure_id,
                data_len,
            },
        ))
    }
}

/// Serialize a hash code checkpoint covering `prefix`.
#[inline]
pub fn hash_code_loggable(prefix: &[u8], page_address: u64) -> [u8; HASH_CODE_LOGGABLE_SIZE] {
    let mut out = [0u8; HASH_CODE_LOGGABLE_SIZE];
    out[0] = HASH_CODE_LOGGABLE;
    out[8..].copy_from_slice(&page_hash(prefix, page_address).to_le_bytes());
    out
}

/// Returns length of the longest prefix of a page that ends with
/// a hash code checkpoint matching all bytes before it.
/// Zero if no checkpoint verifies.
pub fn find_valid_page_part(page: &[u8], page_address: u64) -> usize {
    if page.len() < HASH_CODE_LOGGABLE_SIZE {
        return 0;
    }
    let mut i = (page.len() - HASH_CODE_LOGGABLE_SIZE) & !7;
    loop {
        if page[i] == HASH_CODE_LOGGABLE && page[i + 1..i + 8].iter().all(|b| *b == 0) {
            let mut hash = [0u8; 8];
            hash.copy_from_slice(&page[i + 8..i + HASH_CODE_LOGGABLE_SIZE]);
            if u64::from_le_bytes(hash) == page_hash(&page[..i], page_address) {
                return i + HASH_CODE_LOGGABLE_SIZE;
            }
        }
        if i == 0 {
            return 0;
        }
        i -= 8;
    }
}

/// A record read from log.
#[derive(Debug, Clone)]
pub struct Loggable {
    pub ty: LoggableType,
    pub structure_id: i32,
    /// Address of the header.
    pub address: u64,
    /// Address right after the padded data.
    pub end_address: u64,
    data: ByteView,
}

impl Loggable {
    #[inline]
    pub fn data(&self) -> &ByteView {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> ByteView {
        self.data
    }

    /// Read the loggable starting at current position of reader.
    /// Padding loggables are not expected here.
    #[inline]
    pub fn read<P: LogPages + ?Sized>(reader: &mut PagedLogReader<'_, P>) -> Result<Loggable> {
        let address = reader.address();
        let mut word = [0u8; 8];
        reader.read_exact(&mut word)?;
        if word[0] == NULL_LOGGABLE || word[0] == HASH_CODE_LOGGABLE {
            return Err(Error::InvalidFormat);
        }
        Self::read_rest(reader, address, word)
    }

    /// Read remaining header and data after first word.
    pub(crate) fn read_rest<P: LogPages + ?Sized>(
        reader: &mut PagedLogReader<'_, P>,
        address: u64,
        first_word: [u8; 8],
    ) -> Result<Loggable> {
        let mut header = [0u8; LOGGABLE_HEADER_SIZE];
        header[..8].copy_from_slice(&first_word);
        reader.read_exact(&mut header[8..])?;
        let (_, header) = LoggableHeader::deser(&header[..], 0)?;
        let data_len = header.data_len as usize;
        if reader.address() + data_len as u64 > reader.end() {
            return Err(Error::DataCorrupted(address));
        }
        let mut buf = AlignedBuf::zeroed(data_len);
        reader.read_exact(buf.as_bytes_mut())?;
        reader.skip((align8(data_len) - data_len) as u64);
        Ok(Loggable {
            ty: header.ty,
            structure_id: header.structure_id,
            address,
            end_address: reader.address(),
            data: ByteView::new(buf),
        })
    }
}

/// Iterator of all non-padding loggables from a start address
/// to the end of log.
pub struct LoggableIterator<'a, P: LogPages + ?Sized> {
    reader: PagedLogReader<'a, P>,
    done: bool,
}

impl<'a, P: LogPages + ?Sized> LoggableIterator<'a, P> {
    #[inline]
    pub fn new(reader: PagedLogReader<'a, P>) -> Self {
        LoggableIterator {
            reader,
            done: false,
        }
    }

    #[inline]
    fn next_loggable(&mut self) -> Result<Option<Loggable>> {
        loop {
            if !self.reader.has_next()? {
                return Ok(None);
            }
            let address = self.reader.address();
            let mut word = [0u8; 8];
            self.reader.read_exact(&mut word)?;
            match word[0] {
                NULL_LOGGABLE => continue,
                HASH_CODE_LOGGABLE => {
                    self.reader
                        .skip((HASH_CODE_LOGGABLE_SIZE - NULL_LOGGABLE_SIZE) as u64);
                    continue;
                }
                _ => return Loggable::read_rest(&mut self.reader, address, word).map(Some),
            }
        }
    }
}

impl<P: LogPages + ?Sized> Iterator for LoggableIterator<'_, P> {
    type Item = Result<Loggable>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_loggable() {
            Ok(Some(loggable)) => Some(Ok(loggable)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
