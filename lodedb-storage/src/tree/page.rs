//! Binary layout of tree pages.
//!
//! Page is the payload of a page loggable. Whether it is leaf or
//! internal, root or not, is carried by loggable type.
//!
//! ┌──────────────────────────────┐
//! │ key prefix length(4)         │
//! ├──────────────────────────────┤
//! │ entry count(4)               │
//! ├──────────────────────────────┤
//! │ key slots(8 * count)         │
//! ├──────────────────────────────┤
//! │ value/child slots(8 * count) │
//! ├──────────────────────────────┤
//! │ tree size(8), internal only  │
//! ├──────────────────────────────┤
//! │ embedded key bytes           │
//! └──────────────────────────────┘
//!
//! All integers are little-endian. Key prefix length is reserved
//! for prefix compression and always zero.

use crate::buf::{AlignedBuf, ByteView};
use crate::error::{Error, Result};
use crate::journal::loggable::{Loggable, LoggableType};
use crate::journal::Log;
use crate::serde::Serde;
use crate::tree::traversable::TraversablePage;
use crate::tree::{
    INTERNAL_PAGE, INTERNAL_ROOT_PAGE, KEY_NODE, LEAF_PAGE, LEAF_ROOT_PAGE, VALUE_NODE,
};
use std::mem;
use std::sync::Arc;

pub const PAGE_HEADER_SIZE: usize = 8;
pub const SLOT_SIZE: usize = mem::size_of::<i64>();
pub const TREE_SIZE_SIZE: usize = mem::size_of::<i64>();
/// Bytes an entry occupies beside its embedded key.
pub const ENTRY_OVERHEAD: usize = 2 * SLOT_SIZE;

const KEY_PREFIX_LEN_OFFSET: usize = 0;
const ENTRY_COUNT_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Internal,
}

impl PageKind {
    /// Returns loggable type of a page of this kind.
    #[inline]
    pub fn loggable_type(self, root: bool) -> LoggableType {
        match (self, root) {
            (PageKind::Leaf, false) => LEAF_PAGE,
            (PageKind::Leaf, true) => LEAF_ROOT_PAGE,
            (PageKind::Internal, false) => INTERNAL_PAGE,
            (PageKind::Internal, true) => INTERNAL_ROOT_PAGE,
        }
    }

    /// Decode page kind and root flag from loggable type.
    #[inline]
    pub fn from_loggable_type(ty: LoggableType) -> Result<(PageKind, bool)> {
        match ty {
            LEAF_PAGE => Ok((PageKind::Leaf, false)),
            LEAF_ROOT_PAGE => Ok((PageKind::Leaf, true)),
            INTERNAL_PAGE => Ok((PageKind::Internal, false)),
            INTERNAL_ROOT_PAGE => Ok((PageKind::Internal, true)),
            _ => Err(Error::InvalidFormat),
        }
    }

    /// Size of the fixed part of a page.
    #[inline]
    pub fn base_size(self) -> usize {
        match self {
            PageKind::Leaf => PAGE_HEADER_SIZE,
            PageKind::Internal => PAGE_HEADER_SIZE + TREE_SIZE_SIZE,
        }
    }
}

/// Decoded key slot.
/// On disk, a negative slot is a negated address of a key loggable,
/// a non-negative slot packs size in high 32 bits and offset in
/// low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Embedded { offset: u32, size: u32 },
    Referenced { address: u64 },
}

impl KeySlot {
    #[inline]
    pub fn decode(raw: i64) -> Result<Self> {
        if raw < 0 {
            if raw == i64::MIN {
                return Err(Error::InvalidFormat);
            }
            return Ok(KeySlot::Referenced {
                address: (-raw) as u64,
            });
        }
        Ok(KeySlot::Embedded {
            offset: raw as u32,
            size: (raw >> 32) as u32,
        })
    }

    #[inline]
    pub fn encode(self) -> i64 {
        match self {
            KeySlot::Embedded { offset, size } => ((size as i64) << 32) | offset as i64,
            KeySlot::Referenced { address } => {
                debug_assert!(address > 0 && address <= i64::MAX as u64);
                -(address as i64)
            }
        }
    }
}

/// Key of an entry to be encoded.
#[derive(Debug, Clone, Copy)]
pub enum SlotKey<'a> {
    Embedded(&'a [u8]),
    Referenced(u64),
}

impl SlotKey<'_> {
    #[inline]
    fn embedded_len(&self) -> usize {
        match self {
            SlotKey::Embedded(k) => k.len(),
            SlotKey::Referenced(_) => 0,
        }
    }
}

/// Returns serialized size of a page.
#[inline]
pub fn page_size_of(kind: PageKind, count: usize, embedded_len: usize) -> usize {
    kind.base_size() + count * ENTRY_OVERHEAD + embedded_len
}

/// Encode entries into page bytes.
/// `tree_size` is ignored for leaf pages.
pub fn encode_page(
    kind: PageKind,
    keys: &[SlotKey<'_>],
    addresses: &[u64],
    tree_size: u64,
) -> AlignedBuf {
    debug_assert_eq!(keys.len(), addresses.len());
    let count = keys.len();
    let embedded_len: usize = keys.iter().map(|k| k.embedded_len()).sum();
    let mut buf = AlignedBuf::zeroed(page_size_of(kind, count, embedded_len));
    let out = buf.as_bytes_mut();
    out.ser_i32(KEY_PREFIX_LEN_OFFSET, 0);
    out.ser_i32(ENTRY_COUNT_OFFSET, count as i32);
    let values_offset = PAGE_HEADER_SIZE + count * SLOT_SIZE;
    let mut key_offset = values_offset + count * SLOT_SIZE;
    if kind == PageKind::Internal {
        key_offset = out.ser_u64(key_offset, tree_size);
    }
    for (i, (key, address)) in keys.iter().zip(addresses).enumerate() {
        let slot = match key {
            SlotKey::Embedded(k) => {
                let slot = KeySlot::Embedded {
                    offset: key_offset as u32,
                    size: k.len() as u32,
                };
                key_offset = out.ser_byte_slice(key_offset, k);
                slot
            }
            SlotKey::Referenced(address) => KeySlot::Referenced { address: *address },
        };
        out.ser_i64(PAGE_HEADER_SIZE + i * SLOT_SIZE, slot.encode());
        out.ser_i64(values_offset + i * SLOT_SIZE, *address as i64);
    }
    buf
}

/// Read-only view of a page loggable.
/// Keys and values are decoded lazily from the shared buffer.
#[derive(Clone)]
pub struct ImmutablePage {
    log: Arc<Log>,
    address: u64,
    structure_id: i32,
    kind: PageKind,
    root: bool,
    count: usize,
    data: ByteView,
}

impl ImmutablePage {
    /// Load page at given address.
    #[inline]
    pub fn load(log: &Arc<Log>, address: u64) -> Result<Self> {
        let loggable = log.read(address)?;
        Self::from_loggable(Arc::clone(log), loggable)
    }

    /// Create page from a loggable already read.
    #[inline]
    pub fn from_loggable(log: Arc<Log>, loggable: Loggable) -> Result<Self> {
        let address = loggable.address;
        let structure_id = loggable.structure_id;
        let ty = loggable.ty;
        Self::new(log, address, structure_id, ty, loggable.into_data())
    }

    /// Create page from its components, validating layout.
    pub fn new(
        log: Arc<Log>,
        address: u64,
        structure_id: i32,
        ty: LoggableType,
        data: ByteView,
    ) -> Result<Self> {
        let (kind, root) = PageKind::from_loggable_type(ty)?;
        let (_, prefix_len) = data.deser_i32(KEY_PREFIX_LEN_OFFSET)?;
        if prefix_len != 0 {
            return Err(Error::NotSupported("key prefix compression"));
        }
        let (_, count) = data.deser_i32(ENTRY_COUNT_OFFSET)?;
        if count < 0 || !data.is_word_aligned() {
            return Err(Error::InvalidFormat);
        }
        let count = count as usize;
        if data.len() < page_size_of(kind, count, 0) {
            return Err(Error::InvalidFormat);
        }
        Ok(ImmutablePage {
            log,
            address,
            structure_id,
            kind,
            root,
            count,
            data,
        })
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.root
    }

    #[inline]
    pub fn structure_id(&self) -> i32 {
        self.structure_id
    }

    #[inline]
    pub fn data(&self) -> &ByteView {
        &self.data
    }

    #[inline]
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    #[inline]
    fn slots(&self, offset: usize) -> &[i64] {
        bytemuck::cast_slice(&self.data[offset..offset + self.count * SLOT_SIZE])
    }

    #[inline]
    fn check_index(&self, idx: usize) -> Result<()> {
        if idx >= self.count {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    #[inline]
    pub fn key_slot(&self, idx: usize) -> Result<KeySlot> {
        self.check_index(idx)?;
        KeySlot::decode(i64::from_le(self.slots(PAGE_HEADER_SIZE)[idx]))
    }

    /// Returns address stored in value slot, which is a value
    /// loggable of leaf page or a child page of internal page.
    #[inline]
    pub fn address_at(&self, idx: usize) -> Result<u64> {
        self.check_index(idx)?;
        let raw = i64::from_le(self.slots(PAGE_HEADER_SIZE + self.count * SLOT_SIZE)[idx]);
        if raw <= 0 {
            return Err(Error::InvalidFormat);
        }
        Ok(raw as u64)
    }

    #[inline]
    pub fn child_address(&self, idx: usize) -> Result<u64> {
        debug_assert!(self.kind == PageKind::Internal);
        self.address_at(idx)
    }

    #[inline]
    pub fn value_address(&self, idx: usize) -> Result<u64> {
        debug_assert!(self.kind == PageKind::Leaf);
        self.address_at(idx)
    }

    /// Returns number of entries in the subtree.
    #[inline]
    pub fn tree_size(&self) -> Result<u64> {
        match self.kind {
            PageKind::Leaf => Ok(self.count as u64),
            PageKind::Internal => {
                let (_, size) = self
                    .data
                    .deser_u64(PAGE_HEADER_SIZE + 2 * self.count * SLOT_SIZE)?;
                Ok(size)
            }
        }
    }

    /// Load value of leaf entry.
    #[inline]
    pub fn value(&self, idx: usize) -> Result<ByteView> {
        read_value(&self.log, self.value_address(idx)?)
    }

    /// Load child page of internal entry.
    #[inline]
    pub fn child(&self, idx: usize) -> Result<ImmutablePage> {
        let page = ImmutablePage::load(&self.log, self.child_address(idx)?)?;
        if page.structure_id != self.structure_id || page.root {
            return Err(Error::InvalidFormat);
        }
        Ok(page)
    }
}

impl TraversablePage for ImmutablePage {
    #[inline]
    fn entries_count(&self) -> usize {
        self.count
    }

    #[inline]
    fn is_internal(&self) -> bool {
        self.kind == PageKind::Internal
    }

    #[inline]
    fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    fn key(&self, idx: usize) -> Result<ByteView> {
        match self.key_slot(idx)? {
            KeySlot::Embedded { offset, size } => self.data.slice(offset as usize, size as usize),
            KeySlot::Referenced { address } => read_key(&self.log, address),
        }
    }
}

/// Load a standalone key.
#[inline]
pub fn read_key(log: &Log, address: u64) -> Result<ByteView> {
    let loggable = log.read(address)?;
    if loggable.ty != KEY_NODE {
        return Err(Error::InvalidFormat);
    }
    Ok(loggable.into_data())
}

/// Encode payload of a value loggable.
/// | key length(4) | key | value |
/// Owning key is kept with the value so that a value found in a
/// reclaimed segment can be traced back to its entry.
#[inline]
pub fn encode_value_node(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; mem::size_of::<u32>() + key.len() + value.len()];
    let idx = buf.ser_u32(0, key.len() as u32);
    let idx = buf.ser_byte_slice(idx, key);
    buf.ser_byte_slice(idx, value);
    buf
}

/// Decode payload of a value loggable into key and value.
#[inline]
pub fn decode_value_node(data: &ByteView) -> Result<(ByteView, ByteView)> {
    let (idx, key_len) = data.deser_u32(0)?;
    let key = data.slice(idx, key_len as usize)?;
    let value_start = idx + key_len as usize;
    let value = data.slice(value_start, data.len() - value_start)?;
    Ok((key, value))
}

/// Load a value loggable, returns owning key and value.
#[inline]
pub fn read_value_node(log: &Log, address: u64) -> Result<(ByteView, ByteView)> {
    let loggable = log.read(address)?;
    if loggable.ty != VALUE_NODE {
        return Err(Error::InvalidFormat);
    }
    decode_value_node(loggable.data())
}

/// Load a value.
#[inline]
pub fn read_value(log: &Log, address: u64) -> Result<ByteView> {
    read_value_node(log, address).map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::LogConfig;
    use crate::journal::storage::MemLogStorage;

    fn new_log() -> Arc<Log> {
        Arc::new(Log::open(Arc::new(MemLogStorage::new()), LogConfig::default()).unwrap())
    }

    fn leaf_page(log: &Arc<Log>, keys: &[&[u8]]) -> ImmutablePage {
        let slot_keys: Vec<_> = keys.iter().map(|k| SlotKey::Embedded(k)).collect();
        let values: Vec<_> = keys
            .iter()
            .map(|k| log.append(VALUE_NODE, 1, &encode_value_node(k, k)).unwrap())
            .collect();
        let buf = encode_page(PageKind::Leaf, &slot_keys, &values, 0);
        let address = log.append(LEAF_ROOT_PAGE, 1, buf.as_bytes()).unwrap();
        ImmutablePage::load(log, address).unwrap()
    }

    #[test]
    fn test_key_slot_encoding() {
        let slot = KeySlot::Embedded {
            offset: 40,
            size: 7,
        };
        assert_eq!(slot.encode(), (7 << 32) | 40);
        assert_eq!(KeySlot::decode(slot.encode()).unwrap(), slot);
        let slot = KeySlot::Referenced { address: 4096 };
        assert_eq!(slot.encode(), -4096);
        assert_eq!(KeySlot::decode(-4096).unwrap(), slot);
        assert!(KeySlot::decode(i64::MIN).is_err());
    }

    #[test]
    fn test_page_find_insertion_point() {
        let log = new_log();
        let page = leaf_page(&log, &[&[2], &[4], &[6]]);
        assert_eq!(page.entries_count(), 3);
        assert_eq!(page.find(&[5]).unwrap(), -3);
        assert_eq!(page.find(&[4]).unwrap(), 1);
        assert_eq!(page.find(&[1]).unwrap(), -1);
        assert_eq!(page.find(&[7]).unwrap(), -4);
        assert_eq!(&page.key(2).unwrap()[..], &[6]);
        assert_eq!(&page.value(0).unwrap()[..], &[2]);
        assert_eq!(page.tree_size().unwrap(), 3);
        assert!(page.is_root());
    }

    #[test]
    fn test_internal_page_layout() {
        let log = new_log();
        let long_key = vec![9u8; 300];
        let key_address = log.append(KEY_NODE, 1, &long_key).unwrap();
        let keys = [SlotKey::Embedded(b"abc"), SlotKey::Referenced(key_address)];
        let buf = encode_page(PageKind::Internal, &keys, &[100, 200], 42);
        assert_eq!(buf.len(), page_size_of(PageKind::Internal, 2, 3));
        let bytes = buf.as_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &2i32.to_le_bytes());
        assert_eq!(&bytes[16..24], &(-(key_address as i64)).to_le_bytes());
        assert_eq!(&bytes[24..32], &100i64.to_le_bytes());
        assert_eq!(&bytes[40..48], &42u64.to_le_bytes());
        assert_eq!(&bytes[48..51], b"abc");
        let page = ImmutablePage::new(
            Arc::clone(&log),
            8,
            1,
            INTERNAL_PAGE,
            ByteView::new(buf),
        )
        .unwrap();
        assert!(page.is_internal());
        assert_eq!(page.tree_size().unwrap(), 42);
        assert_eq!(page.child_address(1).unwrap(), 200);
        assert_eq!(&page.key(0).unwrap()[..], b"abc");
        assert_eq!(&page.key(1).unwrap()[..], &long_key[..]);
        assert_eq!(
            page.key_slot(1).unwrap(),
            KeySlot::Referenced {
                address: key_address
            }
        );
        assert_eq!(page.key(2).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_value_node_codec() {
        let data = ByteView::from(encode_value_node(b"key", b"value"));
        let (key, value) = decode_value_node(&data).unwrap();
        assert_eq!(&key[..], b"key");
        assert_eq!(&value[..], b"value");
        let (key, value) = decode_value_node(&ByteView::from(encode_value_node(b"", b""))).unwrap();
        assert!(key.is_empty() && value.is_empty());
        let broken = ByteView::from(vec![9u8, 0, 0, 0, 1]);
        assert_eq!(decode_value_node(&broken).unwrap_err(), Error::InvalidFormat);
    }

    #[test]
    fn test_page_rejects_bad_layout() {
        let log = new_log();
        let mut bytes = vec![0u8; 8];
        bytes[4..8].copy_from_slice(&5i32.to_le_bytes());
        let res = ImmutablePage::new(
            Arc::clone(&log),
            8,
            1,
            LEAF_PAGE,
            ByteView::from(bytes.clone()),
        );
        assert_eq!(res.err(), Some(Error::InvalidFormat));
        bytes[0] = 1;
        let res = ImmutablePage::new(log, 8, 1, LEAF_PAGE, ByteView::from(bytes));
        assert!(matches!(res, Err(Error::NotSupported(_))));
        let res = PageKind::from_loggable_type(VALUE_NODE);
        assert_eq!(res, Err(Error::InvalidFormat));
    }
}
