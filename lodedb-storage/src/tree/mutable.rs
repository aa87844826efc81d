//! Copy-on-write mutation of a tree.
//!
//! Pages are copied into an arena on first write ("fetch"). A
//! mutable internal page refers to each child either by log address
//! (untouched subtree shared with the snapshot) or by arena id.
//! There are no parent links, every mutation re-walks the path
//! from root.
//!
//! Save rebalances underfilled pages, then spills mutable pages to
//! the log bottom-up, splitting those exceeding page budget, and
//! finally writes the root page.

use crate::buf::ByteView;
use crate::conf::TreeConfig;
use crate::error::{Error, Result};
use crate::journal::loggable::{Loggable, NULL_ADDRESS};
use crate::journal::Log;
use crate::tree::cursor::{CursorRegistry, TreeCursor};
use crate::tree::expired::ExpiredLoggableCollection;
use crate::tree::immutable::ImmutableTree;
use crate::tree::page::{
    decode_value_node, encode_page, encode_value_node, page_size_of, read_value, ImmutablePage,
    KeySlot, PageKind, SlotKey, ENTRY_OVERHEAD,
};
use crate::tree::traversable::{
    self, child_index, insertion_point, locate, locate_rightmost, PageId, PageRef, PathFrame,
    TraversablePage, TraversableTree, TreePath,
};
use crate::tree::{is_page_type, KEY_NODE, VALUE_NODE};
use ::log::{debug, trace};
use slab::Slab;
use smallvec::{smallvec, SmallVec};
use std::mem;
use std::ops::Range;
use std::sync::Arc;

/// Key of a mutable entry.
#[derive(Clone)]
struct PageKey {
    bytes: ByteView,
    // address of standalone key loggable, if any.
    stored: Option<u64>,
}

impl PageKey {
    #[inline]
    fn fresh(key: &[u8]) -> Self {
        PageKey {
            bytes: ByteView::copy_from_slice(key),
            stored: None,
        }
    }

    #[inline]
    fn embedded_len(&self, max_embedded: usize) -> usize {
        if self.bytes.len() > max_embedded {
            0
        } else {
            self.bytes.len()
        }
    }

    #[inline]
    fn slot_key(&self, max_embedded: usize) -> Result<SlotKey<'_>> {
        if self.bytes.len() <= max_embedded {
            return Ok(SlotKey::Embedded(&self.bytes));
        }
        match self.stored {
            Some(address) => Ok(SlotKey::Referenced(address)),
            None => Err(Error::InvariantViolation("long key not stored")),
        }
    }
}

enum PageValue {
    Stored(u64),
    Fresh(ByteView),
}

impl PageValue {
    #[inline]
    fn address(&self) -> Result<u64> {
        match self {
            PageValue::Stored(address) => Ok(*address),
            PageValue::Fresh(_) => Err(Error::InvariantViolation("value not stored")),
        }
    }
}

struct LeafEntry {
    key: PageKey,
    value: PageValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildRef {
    Stored(u64),
    Mutable(PageId),
}

struct InternalEntry {
    key: PageKey,
    child: ChildRef,
}

enum MutableNode {
    Leaf(Vec<LeafEntry>),
    Internal {
        entries: Vec<InternalEntry>,
        tree_size: u64,
    },
}

/// In-memory page owned by a mutable tree.
pub struct MutablePage {
    // address of page it was fetched from.
    address: u64,
    node: MutableNode,
}

impl MutablePage {
    #[inline]
    fn empty_leaf() -> Self {
        MutablePage {
            address: NULL_ADDRESS,
            node: MutableNode::Leaf(vec![]),
        }
    }

    #[inline]
    fn key_ref(&self, idx: usize) -> Option<&PageKey> {
        match &self.node {
            MutableNode::Leaf(entries) => entries.get(idx).map(|e| &e.key),
            MutableNode::Internal { entries, .. } => entries.get(idx).map(|e| &e.key),
        }
    }

    /// Estimated size if written as a single page.
    #[inline]
    fn serialized_size(&self, max_embedded: usize) -> usize {
        match &self.node {
            MutableNode::Leaf(entries) => page_size_of(
                PageKind::Leaf,
                entries.len(),
                entries.iter().map(|e| e.key.embedded_len(max_embedded)).sum(),
            ),
            MutableNode::Internal { entries, .. } => page_size_of(
                PageKind::Internal,
                entries.len(),
                entries.iter().map(|e| e.key.embedded_len(max_embedded)).sum(),
            ),
        }
    }
}

impl TraversablePage for MutablePage {
    #[inline]
    fn entries_count(&self) -> usize {
        match &self.node {
            MutableNode::Leaf(entries) => entries.len(),
            MutableNode::Internal { entries, .. } => entries.len(),
        }
    }

    #[inline]
    fn is_internal(&self) -> bool {
        matches!(self.node, MutableNode::Internal { .. })
    }

    #[inline]
    fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    fn key(&self, idx: usize) -> Result<ByteView> {
        self.key_ref(idx)
            .map(|k| k.bytes.clone())
            .ok_or(Error::InvalidArgument)
    }

    #[inline]
    fn find(&self, key: &[u8]) -> Result<isize> {
        let res = match &self.node {
            MutableNode::Leaf(entries) => entries.binary_search_by(|e| e.key.bytes[..].cmp(key)),
            MutableNode::Internal { entries, .. } => {
                entries.binary_search_by(|e| e.key.bytes[..].cmp(key))
            }
        };
        Ok(match res {
            Ok(idx) => idx as isize,
            Err(idx) => -(idx as isize) - 1,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Active,
    Saving,
    Saved,
    Discarded,
}

/// Page written by spill.
struct SpilledPage {
    key: PageKey,
    address: u64,
    tree_size: u64,
    page: ImmutablePage,
}

/// Child entry of an internal page to be written.
struct ChildEntry {
    key: PageKey,
    address: u64,
    // unknown for untouched children.
    tree_size: Option<u64>,
}

type PageIds = SmallVec<[PageId; 8]>;

pub struct MutableTree {
    log: Arc<Log>,
    config: TreeConfig,
    structure_id: i32,
    // root of the snapshot this tree was copied from.
    base_root: u64,
    root: PageRef,
    pages: Slab<MutablePage>,
    size: u64,
    expired: ExpiredLoggableCollection,
    cursors: CursorRegistry,
    state: TreeState,
}

impl MutableTree {
    /// Create a mutable tree on top of given snapshot.
    pub fn new(tree: &ImmutableTree) -> Self {
        let mut pages = Slab::new();
        let root = match tree.root_page() {
            Some(page) => PageRef::Immutable(page.clone()),
            None => PageRef::Mutable(pages.insert(MutablePage::empty_leaf())),
        };
        MutableTree {
            log: Arc::clone(tree.log()),
            config: tree.config().clone(),
            structure_id: tree.structure_id(),
            base_root: tree.root_address(),
            root,
            pages,
            size: tree.size(),
            expired: ExpiredLoggableCollection::new(),
            cursors: CursorRegistry::default(),
            state: TreeState::Active,
        }
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
    pub fn state(&self) -> TreeState {
        self.state
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns root address of the snapshot, or of the saved root
    /// once saved.
    #[inline]
    pub fn root_address(&self) -> u64 {
        self.base_root
    }

    #[inline]
    pub fn expired_loggables(&self) -> &ExpiredLoggableCollection {
        &self.expired
    }

    #[inline]
    pub fn take_expired_loggables(&mut self) -> ExpiredLoggableCollection {
        self.expired.take()
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

    /// Open a cursor registered on this tree.
    #[inline]
    pub fn open_cursor(&mut self) -> TreeCursor {
        TreeCursor::new(Some(self.cursors.register()))
    }

    #[inline]
    pub fn open_cursors(&self) -> usize {
        self.cursors.open_cursors()
    }

    /// Insert or replace value of key.
    /// Returns true if key was not present.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_active()?;
        let (path, found) = self.locate_leaf(key)?;
        let ids = self.make_path_mutable(&path)?;
        let leaf = last_id(&ids)?;
        let inserted = if found >= 0 {
            let old = {
                let entry = self
                    .leaf_entries_mut(leaf)?
                    .get_mut(found as usize)
                    .ok_or(Error::InvariantViolation("leaf index out of range"))?;
                mem::replace(
                    &mut entry.value,
                    PageValue::Fresh(ByteView::copy_from_slice(value)),
                )
            };
            if let PageValue::Stored(address) = old {
                self.expired.add(address);
            }
            false
        } else {
            self.insert_entry(&ids, insertion_point(found), key, value)?;
            true
        };
        self.cursors.notify();
        Ok(inserted)
    }

    /// Insert key only if it does not exist.
    /// Returns false without modification if key exists.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_active()?;
        let (path, found) = self.locate_leaf(key)?;
        if found >= 0 {
            return Ok(false);
        }
        let ids = self.make_path_mutable(&path)?;
        self.insert_entry(&ids, insertion_point(found), key, value)?;
        self.cursors.notify();
        Ok(true)
    }

    /// Append key greater than all existing keys to the rightmost
    /// leaf, without searching.
    pub fn put_right(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        let path = locate_rightmost(self)?
            .ok_or(Error::InvariantViolation("mutable tree without root"))?;
        let (count, last_key) = {
            let frame = path
                .last()
                .ok_or(Error::InvariantViolation("empty path"))?;
            let page = self.page(&frame.page)?;
            let count = page.entries_count();
            let last_key = if count > 0 {
                Some(page.key(count - 1)?)
            } else {
                None
            };
            (count, last_key)
        };
        if let Some(last_key) = last_key {
            if key <= &last_key[..] {
                return Err(Error::InvalidArgument);
            }
            let ids = self.make_path_mutable(&path)?;
            self.insert_entry(&ids, count, key, value)?;
            self.cursors.notify();
            return Ok(());
        }
        // rightmost leaf emptied by deletes, its separator may be
        // greater than key.
        if let Some(greatest) = traversable::last_key(self)? {
            if key <= &greatest[..] {
                return Err(Error::InvalidArgument);
            }
        }
        let (path, found) = self.locate_leaf(key)?;
        if found >= 0 {
            return Err(Error::InvariantViolation("key exists after greatest key"));
        }
        let ids = self.make_path_mutable(&path)?;
        self.insert_entry(&ids, insertion_point(found), key, value)?;
        self.cursors.notify();
        Ok(())
    }

    /// Delete key, returns false if key does not exist.
    #[inline]
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.delete_entry(key, None)
    }

    /// Delete key only if its value equals given value.
    #[inline]
    pub fn delete_pair(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.delete_entry(key, Some(value))
    }

    /// Persist all changes and returns address of new root page.
    /// Log is not flushed. Tree becomes read-only afterwards.
    pub fn save(&mut self) -> Result<u64> {
        self.check_active()?;
        self.state = TreeState::Saving;
        match self.do_save() {
            Ok(address) => {
                self.state = TreeState::Saved;
                self.cursors.notify();
                Ok(address)
            }
            Err(e) => {
                debug!("save of tree {} failed: {e}", self.structure_id);
                self.state = TreeState::Discarded;
                self.pages.clear();
                self.cursors.notify();
                Err(e)
            }
        }
    }

    /// Abort all changes. Loggables already written become garbage.
    #[inline]
    pub fn discard(&mut self) {
        if self.state != TreeState::Active {
            return;
        }
        debug!(
            "tree {} discarded with {} mutable pages",
            self.structure_id,
            self.pages.len()
        );
        self.state = TreeState::Discarded;
        self.pages.clear();
        self.cursors.notify();
    }

    /// Make every live loggable of this tree found among given
    /// loggables mutable, so next save rewrites it outside their
    /// segment. Only loggables of the segment of the first one
    /// are processed. Returns whether anything was reclaimed.
    pub fn reclaim<I>(&mut self, loggables: I) -> Result<bool>
    where
        I: IntoIterator<Item = Result<Loggable>>,
    {
        self.check_active()?;
        let segment_size = self.log.segment_size();
        let mut segment: Option<Range<u64>> = None;
        let mut reclaimed = 0usize;
        for loggable in loggables {
            let loggable = loggable?;
            let range = match &segment {
                Some(range) => range.clone(),
                None => {
                    let start = loggable.address - loggable.address % segment_size;
                    let range = start..start + segment_size;
                    segment = Some(range.clone());
                    range
                }
            };
            if !range.contains(&loggable.address) {
                break;
            }
            if loggable.structure_id != self.structure_id {
                continue;
            }
            let done = match loggable.ty {
                ty if is_page_type(ty) => self.reclaim_page(loggable, &range)?,
                KEY_NODE => self.reclaim_key(loggable)?,
                VALUE_NODE => self.reclaim_value(loggable)?,
                _ => false,
            };
            if done {
                reclaimed += 1;
            }
        }
        debug!(
            "reclaimed {reclaimed} loggables of tree {} in segment {:?}",
            self.structure_id, segment
        );
        if reclaimed > 0 {
            self.cursors.notify();
        }
        Ok(reclaimed > 0)
    }

    #[inline]
    fn check_active(&self) -> Result<()> {
        if self.state != TreeState::Active {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    #[inline]
    fn locate_leaf(&self, key: &[u8]) -> Result<(TreePath, isize)> {
        locate(self, key)?.ok_or(Error::InvariantViolation("mutable tree without root"))
    }

    #[inline]
    fn node(&self, id: PageId) -> Result<&MutablePage> {
        self.pages
            .get(id)
            .ok_or(Error::InvariantViolation("dangling mutable page"))
    }

    #[inline]
    fn node_mut(&mut self, id: PageId) -> Result<&mut MutablePage> {
        self.pages
            .get_mut(id)
            .ok_or(Error::InvariantViolation("dangling mutable page"))
    }

    #[inline]
    fn leaf_entries_mut(&mut self, id: PageId) -> Result<&mut Vec<LeafEntry>> {
        match &mut self.node_mut(id)?.node {
            MutableNode::Leaf(entries) => Ok(entries),
            MutableNode::Internal { .. } => Err(Error::InvariantViolation("expect leaf page")),
        }
    }

    #[inline]
    fn internal_entries(&self, id: PageId) -> Result<&Vec<InternalEntry>> {
        match &self.node(id)?.node {
            MutableNode::Internal { entries, .. } => Ok(entries),
            MutableNode::Leaf(_) => Err(Error::InvariantViolation("expect internal page")),
        }
    }

    #[inline]
    fn internal_entries_mut(&mut self, id: PageId) -> Result<&mut Vec<InternalEntry>> {
        match &mut self.node_mut(id)?.node {
            MutableNode::Internal { entries, .. } => Ok(entries),
            MutableNode::Leaf(_) => Err(Error::InvariantViolation("expect internal page")),
        }
    }

    /// Load a non-root page of this tree.
    #[inline]
    fn load_child(&self, address: u64) -> Result<ImmutablePage> {
        let page = ImmutablePage::load(&self.log, address)?;
        if page.structure_id() != self.structure_id || page.is_root() {
            return Err(Error::InvalidFormat);
        }
        Ok(page)
    }

    /// Copy an immutable page into arena. Source page is expired.
    fn fetch(&mut self, page: &ImmutablePage) -> Result<PageId> {
        let count = page.entries_count();
        let node = if page.is_internal() {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(InternalEntry {
                    key: stored_key(page, i)?,
                    child: ChildRef::Stored(page.child_address(i)?),
                });
            }
            MutableNode::Internal {
                entries,
                tree_size: page.tree_size()?,
            }
        } else {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(LeafEntry {
                    key: stored_key(page, i)?,
                    value: PageValue::Stored(page.value_address(i)?),
                });
            }
            MutableNode::Leaf(entries)
        };
        self.expired.add(page.address());
        trace!(
            "fetched page {} of tree {}",
            page.address(),
            self.structure_id
        );
        Ok(self.pages.insert(MutablePage {
            address: page.address(),
            node,
        }))
    }

    /// Replace stored child link with arena id.
    #[inline]
    fn link_child(&mut self, parent: PageId, idx: usize, address: u64, child: PageId) -> Result<()> {
        let entry = self
            .internal_entries_mut(parent)?
            .get_mut(idx)
            .ok_or(Error::InvariantViolation("child index out of range"))?;
        if entry.child != ChildRef::Stored(address) {
            return Err(Error::InvariantViolation("child link mismatch"));
        }
        entry.child = ChildRef::Mutable(child);
        Ok(())
    }

    /// Fetch every immutable page on the path, returns arena ids
    /// from root to last page of the path.
    fn make_path_mutable(&mut self, path: &[PathFrame]) -> Result<PageIds> {
        let mut ids = PageIds::new();
        for (level, frame) in path.iter().enumerate() {
            let id = match &frame.page {
                PageRef::Mutable(id) => *id,
                PageRef::Immutable(page) => {
                    if level == 0 {
                        match &self.root {
                            PageRef::Immutable(root) if root.address() == page.address() => {}
                            _ => return Err(Error::InvariantViolation("path does not start at root")),
                        }
                    }
                    let id = self.fetch(page)?;
                    if level == 0 {
                        self.root = PageRef::Mutable(id);
                    } else {
                        self.link_child(ids[level - 1], path[level - 1].index, page.address(), id)?;
                    }
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Returns arena id of a child, fetching it if needed.
    #[inline]
    fn mutable_child(&mut self, parent: PageId, idx: usize) -> Result<PageId> {
        let child = self
            .internal_entries(parent)?
            .get(idx)
            .map(|e| e.child)
            .ok_or(Error::InvariantViolation("child index out of range"))?;
        match child {
            ChildRef::Mutable(id) => Ok(id),
            ChildRef::Stored(address) => {
                let page = self.load_child(address)?;
                let id = self.fetch(&page)?;
                self.link_child(parent, idx, address, id)?;
                Ok(id)
            }
        }
    }

    #[inline]
    fn adjust_tree_size(&mut self, ids: &[PageId], delta: i64) -> Result<()> {
        for id in ids {
            if let MutableNode::Internal { tree_size, .. } = &mut self.node_mut(*id)?.node {
                *tree_size = tree_size.wrapping_add_signed(delta);
            }
        }
        Ok(())
    }

    /// Insert new entry into the leaf at the end of path ids.
    fn insert_entry(&mut self, ids: &[PageId], idx: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let leaf = last_id(ids)?;
        let entries = self.leaf_entries_mut(leaf)?;
        if idx > entries.len() {
            return Err(Error::InvariantViolation("leaf index out of range"));
        }
        entries.insert(
            idx,
            LeafEntry {
                key: PageKey::fresh(key),
                value: PageValue::Fresh(ByteView::copy_from_slice(value)),
            },
        );
        self.size += 1;
        self.adjust_tree_size(&ids[..ids.len() - 1], 1)
    }

    fn delete_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.check_active()?;
        let (path, found) = self.locate_leaf(key)?;
        if found < 0 {
            return Ok(false);
        }
        let idx = found as usize;
        if let Some(value) = value {
            let frame = path
                .last()
                .ok_or(Error::InvariantViolation("empty path"))?;
            if &self.value(&frame.page, idx)?[..] != value {
                return Ok(false);
            }
        }
        let ids = self.make_path_mutable(&path)?;
        let entry = {
            let entries = self.leaf_entries_mut(last_id(&ids)?)?;
            if idx >= entries.len() {
                return Err(Error::InvariantViolation("leaf index out of range"));
            }
            entries.remove(idx)
        };
        if let PageValue::Stored(address) = entry.value {
            self.expired.add(address);
        }
        if let Some(address) = entry.key.stored {
            // the key loggable may still serve as separator above.
            let mut shared = false;
            for (level, id) in ids[..ids.len() - 1].iter().enumerate() {
                if self.key_references(&PageRef::Mutable(*id), path[level].index, address)? {
                    shared = true;
                    break;
                }
            }
            if !shared {
                self.expired.add(address);
            }
        }
        self.size -= 1;
        self.adjust_tree_size(&ids[..ids.len() - 1], -1)?;
        self.cursors.notify();
        Ok(true)
    }

    fn do_save(&mut self) -> Result<u64> {
        self.rebalance()?;
        let root = match &self.root {
            PageRef::Immutable(page) if page.is_root() && page.address() == self.base_root => {
                return Ok(self.base_root);
            }
            PageRef::Immutable(page) => {
                let page = page.clone();
                self.fetch(&page)?
            }
            PageRef::Mutable(id) => *id,
        };
        let mut spilled = self.spill(root, true)?;
        while spilled.len() > 1 {
            // root was split, build a new level above.
            let tree_size = spilled.iter().map(|s| s.tree_size).sum();
            let children = spilled
                .into_iter()
                .map(|s| ChildEntry {
                    key: s.key,
                    address: s.address,
                    tree_size: Some(s.tree_size),
                })
                .collect();
            spilled = self.write_internals(children, tree_size, true)?;
        }
        let root = spilled
            .pop()
            .ok_or(Error::InvariantViolation("save produced no root"))?;
        debug!(
            "tree {} saved: root {}, size {}, {} loggables expired",
            self.structure_id,
            root.address,
            self.size,
            self.expired.len()
        );
        self.pages.clear();
        self.base_root = root.address;
        self.root = PageRef::Immutable(root.page);
        Ok(root.address)
    }

    /// Merge underfilled pages and collapse single-child roots.
    fn rebalance(&mut self) -> Result<()> {
        if let PageRef::Mutable(root) = self.root {
            self.rebalance_page(root)?;
        }
        loop {
            let PageRef::Mutable(root) = self.root else {
                break;
            };
            let child = match &self.node(root)?.node {
                MutableNode::Internal { entries, .. } if entries.len() <= 1 => {
                    entries.first().map(|e| e.child)
                }
                _ => break,
            };
            self.pages.try_remove(root);
            match child {
                None => {
                    self.root = PageRef::Mutable(self.pages.insert(MutablePage::empty_leaf()));
                    break;
                }
                Some(ChildRef::Mutable(id)) => self.root = PageRef::Mutable(id),
                Some(ChildRef::Stored(address)) => {
                    // child becomes root, it must be rewritten with root type.
                    let page = self.load_child(address)?;
                    let id = self.fetch(&page)?;
                    self.root = PageRef::Mutable(id);
                }
            }
        }
        Ok(())
    }

    fn rebalance_page(&mut self, id: PageId) -> Result<()> {
        let children: SmallVec<[PageId; 16]> = match &self.node(id)?.node {
            MutableNode::Leaf(_) => return Ok(()),
            MutableNode::Internal { entries, .. } => entries
                .iter()
                .filter_map(|e| match e.child {
                    ChildRef::Mutable(child) => Some(child),
                    ChildRef::Stored(_) => None,
                })
                .collect(),
        };
        for child in children {
            self.rebalance_page(child)?;
        }
        let threshold = self.config.page_budget_usize() / 4;
        let max_embedded = self.config.max_embedded_key_size;
        let mut i = 0;
        loop {
            let (len, child) = {
                let entries = self.internal_entries(id)?;
                match entries.get(i) {
                    Some(entry) => (entries.len(), entry.child),
                    None => break,
                }
            };
            let ChildRef::Mutable(child) = child else {
                i += 1;
                continue;
            };
            let (count, size) = {
                let page = self.node(child)?;
                (page.entries_count(), page.serialized_size(max_embedded))
            };
            if count == 0 {
                self.internal_entries_mut(id)?.remove(i);
                self.pages.try_remove(child);
                continue;
            }
            if len > 1 && size < threshold {
                let left = if i + 1 < len { i } else { i - 1 };
                self.merge_children(id, left)?;
                i = left;
                continue;
            }
            i += 1;
        }
        Ok(())
    }

    /// Merge child at `left + 1` into child at `left`.
    fn merge_children(&mut self, parent: PageId, left: usize) -> Result<()> {
        let left_id = self.mutable_child(parent, left)?;
        let right_id = self.mutable_child(parent, left + 1)?;
        let right = self
            .pages
            .try_remove(right_id)
            .ok_or(Error::InvariantViolation("dangling mutable page"))?;
        match (&mut self.node_mut(left_id)?.node, right.node) {
            (MutableNode::Leaf(l), MutableNode::Leaf(r)) => l.extend(r),
            (
                MutableNode::Internal {
                    entries: l,
                    tree_size: l_size,
                },
                MutableNode::Internal {
                    entries: r,
                    tree_size: r_size,
                },
            ) => {
                l.extend(r);
                *l_size += r_size;
            }
            _ => return Err(Error::InvariantViolation("merge pages of different kinds")),
        }
        self.internal_entries_mut(parent)?.remove(left + 1);
        Ok(())
    }

    /// Write mutable page and its mutable descendants.
    /// A page exceeding budget is split into several pages.
    fn spill(&mut self, id: PageId, root: bool) -> Result<Vec<SpilledPage>> {
        let page = self
            .pages
            .try_remove(id)
            .ok_or(Error::InvariantViolation("dangling mutable page"))?;
        match page.node {
            MutableNode::Leaf(entries) => self.write_leaves(entries, root),
            MutableNode::Internal { entries, tree_size } => {
                let mut children = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry.child {
                        ChildRef::Stored(address) => children.push(ChildEntry {
                            key: entry.key,
                            address,
                            tree_size: None,
                        }),
                        ChildRef::Mutable(child) => {
                            // separator is refreshed to first key of the written child.
                            for s in self.spill(child, false)? {
                                children.push(ChildEntry {
                                    key: s.key,
                                    address: s.address,
                                    tree_size: Some(s.tree_size),
                                });
                            }
                        }
                    }
                }
                self.write_internals(children, tree_size, root)
            }
        }
    }

    fn write_leaves(&self, mut entries: Vec<LeafEntry>, root: bool) -> Result<Vec<SpilledPage>> {
        if entries.is_empty() {
            if !root {
                return Ok(vec![]);
            }
            let page = self.write_page(PageKind::Leaf, true, &[], &[], 0)?;
            return Ok(vec![SpilledPage {
                key: PageKey::fresh(&[]),
                address: page.address(),
                tree_size: 0,
                page,
            }]);
        }
        let max_embedded = self.config.max_embedded_key_size;
        let sizes: Vec<usize> = entries
            .iter()
            .map(|e| ENTRY_OVERHEAD + e.key.embedded_len(max_embedded))
            .collect();
        let chunks = split_chunks(PageKind::Leaf.base_size(), &sizes, self.config.page_budget_usize());
        let single = chunks.len() == 1;
        let mut spilled = Vec::with_capacity(chunks.len());
        for range in chunks {
            let chunk = &mut entries[range];
            // values and long keys are written right before their page.
            for entry in chunk.iter_mut() {
                if let PageValue::Fresh(value) = &entry.value {
                    let data = encode_value_node(&entry.key.bytes, value);
                    let address = self.log.append(VALUE_NODE, self.structure_id, &data)?;
                    entry.value = PageValue::Stored(address);
                }
                self.store_key(&mut entry.key)?;
            }
            let keys = chunk
                .iter()
                .map(|e| e.key.slot_key(max_embedded))
                .collect::<Result<Vec<_>>>()?;
            let addresses = chunk
                .iter()
                .map(|e| e.value.address())
                .collect::<Result<Vec<_>>>()?;
            let tree_size = chunk.len() as u64;
            let page = self.write_page(PageKind::Leaf, root && single, &keys, &addresses, tree_size)?;
            spilled.push(SpilledPage {
                key: chunk[0].key.clone(),
                address: page.address(),
                tree_size,
                page,
            });
        }
        Ok(spilled)
    }

    fn write_internals(
        &self,
        mut children: Vec<ChildEntry>,
        tree_size: u64,
        root: bool,
    ) -> Result<Vec<SpilledPage>> {
        if children.is_empty() {
            return self.write_leaves(vec![], root);
        }
        let max_embedded = self.config.max_embedded_key_size;
        for child in children.iter_mut() {
            self.store_key(&mut child.key)?;
        }
        let sizes: Vec<usize> = children
            .iter()
            .map(|c| ENTRY_OVERHEAD + c.key.embedded_len(max_embedded))
            .collect();
        let chunks = split_chunks(
            PageKind::Internal.base_size(),
            &sizes,
            self.config.page_budget_usize(),
        );
        let single = chunks.len() == 1;
        let mut spilled = Vec::with_capacity(chunks.len());
        for range in chunks {
            let chunk = &children[range];
            let chunk_size = if single {
                tree_size
            } else {
                let mut size = 0;
                for child in chunk {
                    size += match child.tree_size {
                        Some(n) => n,
                        None => self.load_child(child.address)?.tree_size()?,
                    };
                }
                size
            };
            let keys = chunk
                .iter()
                .map(|c| c.key.slot_key(max_embedded))
                .collect::<Result<Vec<_>>>()?;
            let addresses: Vec<u64> = chunk.iter().map(|c| c.address).collect();
            let page = self.write_page(
                PageKind::Internal,
                root && single,
                &keys,
                &addresses,
                chunk_size,
            )?;
            spilled.push(SpilledPage {
                key: chunk[0].key.clone(),
                address: page.address(),
                tree_size: chunk_size,
                page,
            });
        }
        Ok(spilled)
    }

    /// Write key as standalone loggable if it is too long to embed.
    #[inline]
    fn store_key(&self, key: &mut PageKey) -> Result<()> {
        if key.bytes.len() > self.config.max_embedded_key_size && key.stored.is_none() {
            key.stored = Some(self.log.append(KEY_NODE, self.structure_id, &key.bytes)?);
        }
        Ok(())
    }

    fn write_page(
        &self,
        kind: PageKind,
        root: bool,
        keys: &[SlotKey<'_>],
        addresses: &[u64],
        tree_size: u64,
    ) -> Result<ImmutablePage> {
        let buf = encode_page(kind, keys, addresses, tree_size);
        let ty = kind.loggable_type(root);
        let address = self.log.append(ty, self.structure_id, buf.as_bytes())?;
        trace!(
            "spilled {kind:?} page {address} of tree {}, {} entries",
            self.structure_id,
            keys.len()
        );
        ImmutablePage::new(
            Arc::clone(&self.log),
            address,
            self.structure_id,
            ty,
            ByteView::new(buf),
        )
    }

    /// Make page at given address mutable if it is still part of
    /// this tree. The page is searched by its first key.
    fn reclaim_page(&mut self, loggable: Loggable, segment: &Range<u64>) -> Result<bool> {
        let page = ImmutablePage::from_loggable(Arc::clone(&self.log), loggable)?;
        let address = page.address();
        let mut path = TreePath::new();
        let mut current = self.root.clone();
        let first_key = if page.entries_count() > 0 {
            Some(page.key(0)?)
        } else {
            None
        };
        loop {
            let (current_address, internal, found) = {
                let p = self.page(&current)?;
                let found = match first_key.as_ref() {
                    Some(key) if p.is_internal() => Some(p.find(key)?),
                    _ => None,
                };
                (p.address(), p.is_internal(), found)
            };
            if current_address == address {
                let id = match current {
                    PageRef::Mutable(id) => id,
                    PageRef::Immutable(_) => {
                        path.push(PathFrame {
                            page: current,
                            index: 0,
                        });
                        let ids = self.make_path_mutable(&path)?;
                        last_id(&ids)?
                    }
                };
                self.materialize(id, segment)?;
                return Ok(true);
            }
            // only an empty root page has no entries.
            let (true, Some(found)) = (internal, found) else {
                return Ok(false);
            };
            if found < 0 && insertion_point(found) == 0 {
                return Ok(false);
            }
            let index = child_index(found);
            let child = self.child(&current, index)?;
            path.push(PathFrame {
                page: current,
                index,
            });
            current = child;
        }
    }

    /// Load values and keys of a mutable page stored in given segment
    /// into memory, so they are written again on save.
    fn materialize(&mut self, id: PageId, segment: &Range<u64>) -> Result<()> {
        let log = Arc::clone(&self.log);
        let mut expired: SmallVec<[u64; 16]> = smallvec![];
        match &mut self.node_mut(id)?.node {
            MutableNode::Leaf(entries) => {
                for entry in entries.iter_mut() {
                    if let PageValue::Stored(address) = entry.value {
                        if segment.contains(&address) {
                            entry.value = PageValue::Fresh(read_value(&log, address)?);
                            expired.push(address);
                        }
                    }
                    if let Some(address) = entry.key.stored {
                        if segment.contains(&address) {
                            entry.key.stored = None;
                            expired.push(address);
                        }
                    }
                }
            }
            MutableNode::Internal { entries, .. } => {
                for entry in entries.iter_mut() {
                    if entry.key.stored.is_some_and(|a| segment.contains(&a)) {
                        entry.key.stored = None;
                    }
                }
            }
        }
        for address in expired {
            self.expired.add(address);
        }
        Ok(())
    }

    /// Returns whether entry key at given index is stored at address.
    #[inline]
    fn key_references(&self, page: &PageRef, idx: usize, address: u64) -> Result<bool> {
        match page {
            PageRef::Immutable(page) => {
                Ok(page.key_slot(idx)? == KeySlot::Referenced { address })
            }
            PageRef::Mutable(id) => {
                Ok(self.node(*id)?.key_ref(idx).and_then(|k| k.stored) == Some(address))
            }
        }
    }

    #[inline]
    fn key_mut(&mut self, id: PageId, idx: usize) -> Result<&mut PageKey> {
        let key = match &mut self.node_mut(id)?.node {
            MutableNode::Leaf(entries) => entries.get_mut(idx).map(|e| &mut e.key),
            MutableNode::Internal { entries, .. } => entries.get_mut(idx).map(|e| &mut e.key),
        };
        key.ok_or(Error::InvariantViolation("entry index out of range"))
    }

    /// Make every entry referencing given key loggable mutable.
    /// Besides the leaf entry, separators on the path to it may
    /// share the same loggable.
    fn reclaim_key(&mut self, loggable: Loggable) -> Result<bool> {
        let address = loggable.address;
        let key = loggable.into_data();
        let Some((path, found)) = locate(self, &key)? else {
            return Ok(false);
        };
        let leaf_level = path.len() - 1;
        let mut levels: SmallVec<[usize; 8]> = smallvec![];
        for (level, frame) in path.iter().enumerate() {
            if level == leaf_level && found < 0 {
                break;
            }
            if self.key_references(&frame.page, frame.index, address)? {
                levels.push(level);
            }
        }
        let Some(&deepest) = levels.last() else {
            return Ok(false);
        };
        let ids = self.make_path_mutable(&path[..=deepest])?;
        for level in levels {
            self.key_mut(ids[level], path[level].index)?.stored = None;
        }
        self.expired.add(address);
        Ok(true)
    }

    /// Make the entry referencing given value loggable mutable.
    fn reclaim_value(&mut self, loggable: Loggable) -> Result<bool> {
        let address = loggable.address;
        let (key, value) = decode_value_node(loggable.data())?;
        let Some((path, found)) = locate(self, &key)? else {
            return Ok(false);
        };
        if found < 0 {
            return Ok(false);
        }
        let idx = found as usize;
        let frame = path
            .last()
            .ok_or(Error::InvariantViolation("empty path"))?;
        let referenced = match &frame.page {
            PageRef::Immutable(page) => page.value_address(idx)? == address,
            PageRef::Mutable(id) => match &self.node(*id)?.node {
                MutableNode::Leaf(entries) => entries
                    .get(idx)
                    .is_some_and(|e| matches!(e.value, PageValue::Stored(a) if a == address)),
                MutableNode::Internal { .. } => false,
            },
        };
        if !referenced {
            return Ok(false);
        }
        let ids = self.make_path_mutable(&path)?;
        let entry = self
            .leaf_entries_mut(last_id(&ids)?)?
            .get_mut(idx)
            .ok_or(Error::InvariantViolation("leaf index out of range"))?;
        entry.value = PageValue::Fresh(value);
        self.expired.add(address);
        Ok(true)
    }
}

impl TraversableTree for MutableTree {
    #[inline]
    fn root_ref(&self) -> Result<Option<PageRef>> {
        Ok(Some(self.root.clone()))
    }

    #[inline]
    fn page<'a>(&'a self, page: &'a PageRef) -> Result<&'a dyn TraversablePage> {
        match page {
            PageRef::Immutable(page) => Ok(page),
            PageRef::Mutable(id) => Ok(self.node(*id)?),
        }
    }

    #[inline]
    fn child(&self, page: &PageRef, idx: usize) -> Result<PageRef> {
        match page {
            PageRef::Immutable(page) => page.child(idx).map(PageRef::Immutable),
            PageRef::Mutable(id) => {
                let child = self
                    .internal_entries(*id)?
                    .get(idx)
                    .map(|e| e.child)
                    .ok_or(Error::InvariantViolation("child index out of range"))?;
                match child {
                    ChildRef::Mutable(child) => Ok(PageRef::Mutable(child)),
                    ChildRef::Stored(address) => self.load_child(address).map(PageRef::Immutable),
                }
            }
        }
    }

    #[inline]
    fn value(&self, page: &PageRef, idx: usize) -> Result<ByteView> {
        match page {
            PageRef::Immutable(page) => page.value(idx),
            PageRef::Mutable(id) => match &self.node(*id)?.node {
                MutableNode::Leaf(entries) => match entries.get(idx).map(|e| &e.value) {
                    Some(PageValue::Stored(address)) => read_value(&self.log, *address),
                    Some(PageValue::Fresh(value)) => Ok(value.clone()),
                    None => Err(Error::InvariantViolation("leaf index out of range")),
                },
                MutableNode::Internal { .. } => Err(Error::InvariantViolation("expect leaf page")),
            },
        }
    }
}

#[inline]
fn last_id(ids: &[PageId]) -> Result<PageId> {
    ids.last()
        .copied()
        .ok_or(Error::InvariantViolation("empty path"))
}

/// Key of an immutable page entry, keeping address of its
/// standalone loggable.
#[inline]
fn stored_key(page: &ImmutablePage, idx: usize) -> Result<PageKey> {
    let stored = match page.key_slot(idx)? {
        KeySlot::Referenced { address } => Some(address),
        KeySlot::Embedded { .. } => None,
    };
    Ok(PageKey {
        bytes: page.key(idx)?,
        stored,
    })
}

/// Split entries into balanced chunks, each fitting into budget.
fn split_chunks(base: usize, sizes: &[usize], budget: usize) -> SmallVec<[Range<usize>; 4]> {
    let total: usize = sizes.iter().sum();
    let payload_budget = budget.saturating_sub(base).max(1);
    if total <= payload_budget {
        return smallvec![0..sizes.len()];
    }
    let pages = total.div_ceil(payload_budget);
    let target = total.div_ceil(pages);
    let mut chunks = SmallVec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, size) in sizes.iter().enumerate() {
        if i > start && (used + size > payload_budget || used >= target) {
            chunks.push(start..i);
            start = i;
            used = 0;
        }
        used += size;
    }
    chunks.push(start..sizes.len());
    chunks
}
