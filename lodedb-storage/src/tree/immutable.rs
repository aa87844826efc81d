use crate::buf::ByteView;
use crate::conf::TreeConfig;
use crate::error::{Error, Result};
use crate::journal::loggable::NULL_ADDRESS;
use crate::journal::Log;
use crate::tree::cursor::TreeCursor;
use crate::tree::mutable::MutableTree;
use crate::tree::page::{ImmutablePage, KeySlot};
use crate::tree::traversable::{self, PageRef, TraversablePage, TraversableTree};
use std::collections::VecDeque;
use std::sync::Arc;

/// Read-only tree bound to one root address.
/// Pages are never modified once written, so any number of
/// readers can share the same root.
#[derive(Clone)]
pub struct ImmutableTree {
    log: Arc<Log>,
    config: TreeConfig,
    structure_id: i32,
    root: Option<ImmutablePage>,
    size: u64,
}

impl ImmutableTree {
    /// Open tree at given root address.
    /// Null address opens an empty tree.
    pub fn open(
        log: Arc<Log>,
        config: TreeConfig,
        structure_id: i32,
        root_address: u64,
    ) -> Result<Self> {
        config.validate()?;
        if root_address == NULL_ADDRESS {
            return Ok(ImmutableTree {
                log,
                config,
                structure_id,
                root: None,
                size: 0,
            });
        }
        let root = ImmutablePage::load(&log, root_address)?;
        if !root.is_root() || root.structure_id() != structure_id {
            return Err(Error::InvalidFormat);
        }
        let size = root.tree_size()?;
        Ok(ImmutableTree {
            log,
            config,
            structure_id,
            root: Some(root),
            size,
        })
    }

    /// Open tree which must already exist.
    #[inline]
    pub fn open_existing(
        log: Arc<Log>,
        config: TreeConfig,
        structure_id: i32,
        root_address: u64,
    ) -> Result<Self> {
        if root_address == NULL_ADDRESS {
            return Err(Error::InvalidArgument);
        }
        Self::open(log, config, structure_id, root_address)
    }

    #[inline]
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    #[inline]
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[inline]
    pub fn structure_id(&self) -> i32 {
        self.structure_id
    }

    #[inline]
    pub fn root_page(&self) -> Option<&ImmutablePage> {
        self.root.as_ref()
    }

    /// Returns root address, null if tree was opened empty.
    #[inline]
    pub fn root_address(&self) -> u64 {
        self.root
            .as_ref()
            .map(|r| r.address())
            .unwrap_or(NULL_ADDRESS)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn get(&self, key: &[u8]) -> Result<Option<ByteView>> {
        traversable::get(self, key)
    }

    #[inline]
    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    #[inline]
    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some_and(|v| v == value))
    }

    /// Open a cursor positioned before first entry.
    #[inline]
    pub fn open_cursor(&self) -> TreeCursor {
        TreeCursor::new(None)
    }

    /// Create a mutable tree on top of this snapshot.
    #[inline]
    pub fn mutable_copy(&self) -> MutableTree {
        MutableTree::new(self)
    }

    /// Iterate all live log addresses of this tree: pages, keys
    /// stored out of page and values. A key loggable referenced
    /// by several pages is yielded once per reference.
    #[inline]
    pub fn address_iterator(&self) -> AddressIterator {
        AddressIterator::new(self.root.clone())
    }
}

impl TraversableTree for ImmutableTree {
    #[inline]
    fn root_ref(&self) -> Result<Option<PageRef>> {
        Ok(self.root.clone().map(PageRef::Immutable))
    }

    #[inline]
    fn page<'a>(&'a self, page: &'a PageRef) -> Result<&'a dyn TraversablePage> {
        match page {
            PageRef::Immutable(page) => Ok(page),
            PageRef::Mutable(_) => Err(Error::InvariantViolation("mutable page in immutable tree")),
        }
    }

    #[inline]
    fn child(&self, page: &PageRef, idx: usize) -> Result<PageRef> {
        match page {
            PageRef::Immutable(page) => page.child(idx).map(PageRef::Immutable),
            PageRef::Mutable(_) => Err(Error::InvariantViolation("mutable page in immutable tree")),
        }
    }

    #[inline]
    fn value(&self, page: &PageRef, idx: usize) -> Result<ByteView> {
        match page {
            PageRef::Immutable(page) => page.value(idx),
            PageRef::Mutable(_) => Err(Error::InvariantViolation("mutable page in immutable tree")),
        }
    }
}

/// Depth-first iterator of live addresses.
pub struct AddressIterator {
    stack: Vec<(ImmutablePage, usize)>,
    pending: VecDeque<u64>,
}

impl AddressIterator {
    #[inline]
    fn new(root: Option<ImmutablePage>) -> Self {
        let mut pending = VecDeque::new();
        let mut stack = vec![];
        if let Some(root) = root {
            pending.push_back(root.address());
            stack.push((root, 0));
        }
        AddressIterator { stack, pending }
    }

    fn step(&mut self) -> Result<()> {
        let Some((page, idx)) = self.stack.last_mut() else {
            return Ok(());
        };
        if *idx >= page.entries_count() {
            self.stack.pop();
            return Ok(());
        }
        let i = *idx;
        *idx += 1;
        if let KeySlot::Referenced { address } = page.key_slot(i)? {
            self.pending.push_back(address);
        }
        if page.is_internal() {
            let child = page.child(i)?;
            self.pending.push_back(child.address());
            self.stack.push((child, 0));
        } else {
            self.pending.push_back(page.value_address(i)?);
        }
        Ok(())
    }
}

impl Iterator for AddressIterator {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(address) = self.pending.pop_front() {
                return Some(Ok(address));
            }
            if self.stack.is_empty() {
                return None;
            }
            if let Err(e) = self.step() {
                self.stack.clear();
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::LogConfig;
    use crate::journal::storage::MemLogStorage;
    use crate::tree::{KEY_NODE, VALUE_NODE};
    use std::collections::HashSet;

    fn new_log() -> Arc<Log> {
        Arc::new(Log::open(Arc::new(MemLogStorage::new()), LogConfig::default()).unwrap())
    }

    fn small_config() -> TreeConfig {
        TreeConfig::default()
            .page_budget(512u64)
            .max_embedded_key_size(32)
    }

    #[test]
    fn test_open_empty_and_existing() {
        let log = new_log();
        let tree = ImmutableTree::open(Arc::clone(&log), small_config(), 1, NULL_ADDRESS).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root_address(), NULL_ADDRESS);
        assert_eq!(tree.get(b"a").unwrap(), None);
        let mut cursor = tree.open_cursor();
        assert!(!cursor.get_next(&tree).unwrap());
        assert_eq!(tree.address_iterator().count(), 0);
        let res = ImmutableTree::open_existing(Arc::clone(&log), small_config(), 1, NULL_ADDRESS);
        assert_eq!(res.err(), Some(Error::InvalidArgument));
        // empty tree saved as an empty root page.
        let root = tree.mutable_copy().save().unwrap();
        let tree = ImmutableTree::open_existing(Arc::clone(&log), small_config(), 1, root).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root_address(), root);
        // wrong structure id.
        let res = ImmutableTree::open(Arc::clone(&log), small_config(), 2, root);
        assert_eq!(res.err(), Some(Error::InvalidFormat));
        // not a page.
        let value = log.append(VALUE_NODE, 1, b"xx").unwrap();
        let res = ImmutableTree::open(log, small_config(), 1, value);
        assert_eq!(res.err(), Some(Error::InvalidFormat));
    }

    #[test]
    fn test_get_has_key_has_pair() {
        let log = new_log();
        let tree = ImmutableTree::open(Arc::clone(&log), small_config(), 3, NULL_ADDRESS).unwrap();
        let mut mtree = tree.mutable_copy();
        for i in 0..500u32 {
            mtree.put(format!("key{i:05}").as_bytes(), &i.to_le_bytes()).unwrap();
        }
        let root = mtree.save().unwrap();
        let tree = ImmutableTree::open(log, small_config(), 3, root).unwrap();
        assert_eq!(tree.size(), 500);
        assert_eq!(
            &tree.get(b"key00250").unwrap().unwrap()[..],
            &250u32.to_le_bytes()
        );
        assert!(tree.has_key(b"key00499").unwrap());
        assert!(!tree.has_key(b"key00500").unwrap());
        assert!(!tree.has_key(b"a").unwrap());
        assert!(tree.has_pair(b"key00007", &7u32.to_le_bytes()).unwrap());
        assert!(!tree.has_pair(b"key00007", &8u32.to_le_bytes()).unwrap());
    }

    #[test]
    fn test_address_iterator() {
        let log = new_log();
        let tree = ImmutableTree::open(Arc::clone(&log), small_config(), 1, NULL_ADDRESS).unwrap();
        let mut mtree = tree.mutable_copy();
        for i in 0..200u32 {
            let mut key = vec![b'k'; if i % 10 == 0 { 100 } else { 8 }];
            key.extend_from_slice(&i.to_be_bytes());
            mtree.put(&key, &i.to_be_bytes()).unwrap();
        }
        let root = mtree.save().unwrap();
        let tree = ImmutableTree::open(Arc::clone(&log), small_config(), 1, root).unwrap();
        let addresses: Vec<u64> = tree.address_iterator().map(|a| a.unwrap()).collect();
        let unique: HashSet<u64> = addresses.iter().copied().collect();
        assert_eq!(addresses[0], root);
        // every loggable written by save is live.
        let mut written = HashSet::new();
        let mut values = 0;
        let mut keys = 0;
        for loggable in log.loggables(8) {
            let loggable = loggable.unwrap();
            written.insert(loggable.address);
            match loggable.ty {
                VALUE_NODE => values += 1,
                KEY_NODE => keys += 1,
                _ => {}
            }
        }
        assert_eq!(values, 200);
        assert_eq!(keys, 20);
        assert_eq!(unique, written);
    }
}
