//! Cursor over tree entries in key order.
//!
//! A cursor is a handle that keeps a root-to-leaf path, and takes
//! the tree by reference on each call. Cursors opened on a mutable
//! tree are registered on it. Every mutation marks them stale, and
//! a stale cursor re-locates its position by current key before
//! moving.

use crate::buf::ByteView;
use crate::error::{Error, Result};
use crate::tree::mutable::MutableTree;
use crate::tree::traversable::{locate, PageRef, PathFrame, TraversableTree, TreePath};
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Registry of cursors opened on a mutable tree.
/// Only weak references are kept, a dropped or closed cursor
/// disappears on next notification.
#[derive(Default)]
pub struct CursorRegistry {
    next_id: u64,
    cursors: HashMap<u64, Weak<AtomicBool>>,
}

impl CursorRegistry {
    #[inline]
    pub fn register(&mut self) -> CursorRegistration {
        let id = self.next_id;
        self.next_id += 1;
        let stale = Arc::new(AtomicBool::new(false));
        self.cursors.insert(id, Arc::downgrade(&stale));
        CursorRegistration { stale }
    }

    /// Mark all open cursors stale.
    #[inline]
    pub fn notify(&mut self) {
        self.cursors.retain(|_, flag| match flag.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        });
    }

    /// Returns number of cursors still open.
    #[inline]
    pub fn open_cursors(&self) -> usize {
        self.cursors
            .values()
            .filter(|flag| flag.strong_count() > 0)
            .count()
    }
}

/// Registration of one cursor, dropping it deregisters the cursor.
pub struct CursorRegistration {
    stale: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    OnEntry,
    AfterLast,
}

pub struct TreeCursor {
    stack: TreePath,
    position: Position,
    key: Option<ByteView>,
    value: Option<ByteView>,
    registration: Option<CursorRegistration>,
    closed: bool,
}

impl TreeCursor {
    /// Create a cursor positioned before first entry.
    #[inline]
    pub fn new(registration: Option<CursorRegistration>) -> Self {
        TreeCursor {
            stack: TreePath::new(),
            position: Position::BeforeFirst,
            key: None,
            value: None,
            registration,
            closed: false,
        }
    }

    /// Move to next entry, returns false if there is none.
    #[inline]
    pub fn get_next<T: TraversableTree + ?Sized>(&mut self, tree: &T) -> Result<bool> {
        self.move_cursor(tree, true)
    }

    /// Move to previous entry, returns false if there is none.
    #[inline]
    pub fn get_prev<T: TraversableTree + ?Sized>(&mut self, tree: &T) -> Result<bool> {
        self.move_cursor(tree, false)
    }

    /// Position on the entry with exactly given key and returns its
    /// value. Position is unchanged if key does not exist.
    pub fn get_search_key<T: TraversableTree + ?Sized>(
        &mut self,
        tree: &T,
        key: &[u8],
    ) -> Result<Option<ByteView>> {
        self.check_open()?;
        match locate(tree, key)? {
            Some((path, found)) if found >= 0 => {
                self.stack = path;
                self.load_entry(tree)?;
                self.clear_stale();
                Ok(self.value.clone())
            }
            _ => Ok(None),
        }
    }

    /// Position on the first entry whose key is not less than given
    /// key and returns its value. Position is unchanged if there is
    /// no such entry.
    pub fn get_search_key_range<T: TraversableTree + ?Sized>(
        &mut self,
        tree: &T,
        key: &[u8],
    ) -> Result<Option<ByteView>> {
        self.check_open()?;
        let Some((path, found)) = locate(tree, key)? else {
            return Ok(None);
        };
        let saved_stack = mem::replace(&mut self.stack, path);
        let saved = (self.position, self.key.take(), self.value.take());
        let positioned = if found >= 0 || self.leaf_index_valid(tree)? {
            self.load_entry(tree)?;
            true
        } else {
            self.advance(tree, true)?
        };
        if positioned {
            self.clear_stale();
            return Ok(self.value.clone());
        }
        self.stack = saved_stack;
        (self.position, self.key, self.value) = saved;
        Ok(None)
    }

    /// Returns key of current entry.
    #[inline]
    pub fn get_key(&self) -> Option<&ByteView> {
        self.key.as_ref()
    }

    /// Returns value of current entry.
    #[inline]
    pub fn get_value(&self) -> Option<&ByteView> {
        self.value.as_ref()
    }

    /// Number of entries with current key, tree keys are unique.
    #[inline]
    pub fn count(&self) -> usize {
        if !self.closed && self.position == Position::OnEntry {
            1
        } else {
            0
        }
    }

    /// Delete current entry from the tree.
    /// Cursor keeps the deleted key, next move continues from it.
    pub fn delete_current(&mut self, tree: &mut MutableTree) -> Result<bool> {
        self.check_open()?;
        if self.registration.is_none() {
            return Err(Error::InvalidState);
        }
        if self.position != Position::OnEntry {
            return Ok(false);
        }
        let Some(key) = self.key.clone() else {
            return Ok(false);
        };
        tree.delete(&key)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the cursor and deregister it from its tree.
    /// Closing a closed cursor does nothing.
    #[inline]
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.registration = None;
        self.stack.clear();
        self.key = None;
        self.value = None;
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    #[inline]
    fn take_stale(&self) -> bool {
        self.registration
            .as_ref()
            .map(|r| r.stale.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }

    #[inline]
    fn clear_stale(&self) {
        if let Some(r) = self.registration.as_ref() {
            r.stale.store(false, Ordering::Release);
        }
    }

    fn move_cursor<T: TraversableTree + ?Sized>(&mut self, tree: &T, forward: bool) -> Result<bool> {
        self.check_open()?;
        if self.take_stale() && self.position == Position::OnEntry {
            return self.reposition(tree, forward);
        }
        match (self.position, forward) {
            (Position::OnEntry, _) => self.advance(tree, forward),
            (Position::BeforeFirst, true) | (Position::AfterLast, false) => {
                self.move_to_edge(tree, forward)
            }
            (Position::BeforeFirst, false) | (Position::AfterLast, true) => Ok(false),
        }
    }

    /// Find position by cached key in current tree, then move to
    /// the entry after (or before) it.
    fn reposition<T: TraversableTree + ?Sized>(&mut self, tree: &T, forward: bool) -> Result<bool> {
        let Some(key) = self.key.clone() else {
            return self.exhaust(forward);
        };
        self.stack.clear();
        let Some((path, found)) = locate(tree, &key)? else {
            return self.exhaust(forward);
        };
        self.stack = path;
        // leaf index is insertion point, entry at it is the successor.
        if found < 0 && forward && self.leaf_index_valid(tree)? {
            self.load_entry(tree)?;
            return Ok(true);
        }
        self.advance(tree, forward)
    }

    fn move_to_edge<T: TraversableTree + ?Sized>(&mut self, tree: &T, forward: bool) -> Result<bool> {
        self.stack.clear();
        let Some(root) = tree.root_ref()? else {
            return self.exhaust(forward);
        };
        if self.descend(tree, root, forward)? {
            self.load_entry(tree)?;
            return Ok(true);
        }
        self.advance(tree, forward)
    }

    /// Push frames from given page down to leftmost (or rightmost)
    /// leaf. Returns false if an empty page is reached.
    fn descend<T: TraversableTree + ?Sized>(
        &mut self,
        tree: &T,
        start: PageRef,
        forward: bool,
    ) -> Result<bool> {
        let mut current = start;
        loop {
            let (internal, count) = {
                let page = tree.page(&current)?;
                (page.is_internal(), page.entries_count())
            };
            if count == 0 {
                self.stack.push(PathFrame {
                    page: current,
                    index: 0,
                });
                return Ok(false);
            }
            let index = if forward { 0 } else { count - 1 };
            if !internal {
                self.stack.push(PathFrame {
                    page: current,
                    index,
                });
                return Ok(true);
            }
            let child = tree.child(&current, index)?;
            self.stack.push(PathFrame {
                page: current,
                index,
            });
            current = child;
        }
    }

    /// Step to the neighbour entry, climbing up and down the path
    /// across page boundaries.
    fn advance<T: TraversableTree + ?Sized>(&mut self, tree: &T, forward: bool) -> Result<bool> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return self.exhaust(forward);
            };
            let (internal, count) = {
                let page = tree.page(&frame.page)?;
                (page.is_internal(), page.entries_count())
            };
            let next = if forward {
                frame.index.checked_add(1)
            } else {
                frame.index.checked_sub(1)
            };
            let Some(next) = next.filter(|i| *i < count) else {
                self.stack.pop();
                continue;
            };
            frame.index = next;
            if !internal {
                self.load_entry(tree)?;
                return Ok(true);
            }
            let child = tree.child(&frame.page, next)?;
            if self.descend(tree, child, forward)? {
                self.load_entry(tree)?;
                return Ok(true);
            }
        }
    }

    #[inline]
    fn leaf_index_valid<T: TraversableTree + ?Sized>(&self, tree: &T) -> Result<bool> {
        let Some(frame) = self.stack.last() else {
            return Ok(false);
        };
        Ok(frame.index < tree.page(&frame.page)?.entries_count())
    }

    #[inline]
    fn load_entry<T: TraversableTree + ?Sized>(&mut self, tree: &T) -> Result<()> {
        let Some(frame) = self.stack.last() else {
            return Err(Error::InvariantViolation("cursor without leaf"));
        };
        let key = tree.page(&frame.page)?.key(frame.index)?;
        let value = tree.value(&frame.page, frame.index)?;
        self.key = Some(key);
        self.value = Some(value);
        self.position = Position::OnEntry;
        Ok(())
    }

    #[inline]
    fn exhaust(&mut self, forward: bool) -> Result<bool> {
        self.stack.clear();
        self.key = None;
        self.value = None;
        self.position = if forward {
            Position::AfterLast
        } else {
            Position::BeforeFirst
        };
        Ok(false)
    }
}
