use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ops::Deref;
use std::sync::Arc;

/// AlignedBuf is a byte buffer whose start address is aligned
/// to machine word (8 bytes).
/// Page payloads are decoded in place, so every multi-byte
/// slot read on a page must be alignment-safe.
pub struct AlignedBuf {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuf {
    /// Create a new buffer with all data initialized to zero.
    #[inline]
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(mem::size_of::<u64>())];
        AlignedBuf {
            words: words.into_boxed_slice(),
            len,
        }
    }

    /// Create a new buffer with given data.
    #[inline]
    pub fn with_data(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.as_bytes_mut().copy_from_slice(data);
        buf
    }

    /// Returns length of data.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns reference of data slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    /// Returns mutable reference of data slice.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

/// Immutable, cheaply clonable view on a shared aligned buffer.
/// Keys and values returned by trees are views on the page or
/// loggable buffer they were read from, no copy is involved.
#[derive(Clone)]
pub struct ByteView {
    buf: Arc<AlignedBuf>,
    start: usize,
    len: usize,
}

impl ByteView {
    #[inline]
    pub fn new(buf: AlignedBuf) -> Self {
        let len = buf.len();
        ByteView {
            buf: Arc::new(buf),
            start: 0,
            len,
        }
    }

    /// Copy given bytes into a new view.
    #[inline]
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::new(AlignedBuf::with_data(data))
    }

    /// Returns a sub-view, bounds are checked against this view.
    #[inline]
    pub fn slice(&self, start: usize, len: usize) -> Result<ByteView> {
        match start.checked_add(len) {
            Some(end) if end <= self.len => Ok(ByteView {
                buf: Arc::clone(&self.buf),
                start: self.start + start,
                len,
            }),
            _ => Err(Error::InvalidFormat),
        }
    }

    /// Returns whether the first byte of this view is word aligned.
    #[inline]
    pub fn is_word_aligned(&self) -> bool {
        self.start % mem::align_of::<u64>() == 0
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.deref().to_vec()
    }
}

impl Deref for ByteView {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.buf.as_bytes()[self.start..self.start + self.len]
    }
}

impl AsRef<[u8]> for ByteView {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Borrow<[u8]> for ByteView {
    #[inline]
    fn borrow(&self) -> &[u8] {
        self
    }
}

impl From<&[u8]> for ByteView {
    #[inline]
    fn from(src: &[u8]) -> Self {
        ByteView::copy_from_slice(src)
    }
}

impl From<Vec<u8>> for ByteView {
    #[inline]
    fn from(src: Vec<u8>) -> Self {
        ByteView::copy_from_slice(&src)
    }
}

impl PartialEq for ByteView {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.deref() == other.deref()
    }
}

impl Eq for ByteView {}

impl PartialEq<[u8]> for ByteView {
    #[inline]
    fn eq(&self, other: &[u8]) -> bool {
        self.deref() == other
    }
}

impl PartialEq<&[u8]> for ByteView {
    #[inline]
    fn eq(&self, other: &&[u8]) -> bool {
        self.deref() == *other
    }
}

impl PartialOrd for ByteView {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteView {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.deref().cmp(other.deref())
    }
}

impl Hash for ByteView {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.deref().hash(state)
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteView({})", hex::encode(self.deref()))
    }
}
