use crate::buf::ByteView;
use crate::error::{Error, Result};
use crate::tree::page::ImmutablePage;
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Arena index of a mutable page.
pub type PageId = usize;

/// Common read capability of immutable and mutable pages.
pub trait TraversablePage {
    fn entries_count(&self) -> usize;

    fn is_internal(&self) -> bool;

    /// Log address of the page. For a mutable page, it is the
    /// address of the page it was fetched from, or null if new.
    fn address(&self) -> u64;

    fn key(&self, idx: usize) -> Result<ByteView>;

    /// Binary search key in page.
    /// Returns index if found, otherwise `-(insertion point) - 1`.
    #[inline]
    fn find(&self, key: &[u8]) -> Result<isize> {
        let mut low = 0usize;
        let mut high = self.entries_count();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid)?[..].cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid as isize),
            }
        }
        Ok(-(low as isize) - 1)
    }
}

/// Returns insertion point encoded in a failed find result.
#[inline]
pub fn insertion_point(found: isize) -> usize {
    debug_assert!(found < 0);
    (-found - 1) as usize
}

/// Returns index of child covering the key, the rightmost child
/// whose first key is not greater than the key.
#[inline]
pub fn child_index(found: isize) -> usize {
    if found >= 0 {
        return found as usize;
    }
    insertion_point(found).saturating_sub(1)
}

/// Reference to a page of a tree.
#[derive(Clone)]
pub enum PageRef {
    Immutable(ImmutablePage),
    Mutable(PageId),
}

/// One level of a root-to-leaf path.
/// For internal pages, index is the child descended into.
/// For leaf page, index is the entry or insertion point.
#[derive(Clone)]
pub struct PathFrame {
    pub page: PageRef,
    pub index: usize,
}

pub type TreePath = SmallVec<[PathFrame; 8]>;

/// Navigation capability shared by both tree variants, used by
/// lookups and cursors.
pub trait TraversableTree {
    /// Returns root page, none if tree has no root page.
    fn root_ref(&self) -> Result<Option<PageRef>>;

    fn page<'a>(&'a self, page: &'a PageRef) -> Result<&'a dyn TraversablePage>;

    fn child(&self, page: &PageRef, idx: usize) -> Result<PageRef>;

    fn value(&self, page: &PageRef, idx: usize) -> Result<ByteView>;
}

/// Descend from root to the leaf covering given key.
/// Returns path and find result in leaf.
pub fn locate<T: TraversableTree + ?Sized>(
    tree: &T,
    key: &[u8],
) -> Result<Option<(TreePath, isize)>> {
    let Some(mut current) = tree.root_ref()? else {
        return Ok(None);
    };
    let mut path = TreePath::new();
    loop {
        let (found, internal, count) = {
            let page = tree.page(&current)?;
            (page.find(key)?, page.is_internal(), page.entries_count())
        };
        if !internal {
            let index = if found >= 0 {
                found as usize
            } else {
                insertion_point(found)
            };
            path.push(PathFrame {
                page: current,
                index,
            });
            return Ok(Some((path, found)));
        }
        if count == 0 {
            return Err(Error::InvariantViolation("internal page without entries"));
        }
        let index = child_index(found);
        let child = tree.child(&current, index)?;
        path.push(PathFrame {
            page: current,
            index,
        });
        current = child;
    }
}

/// Descend from root along the last children.
/// Leaf index of returned path is entry count of the leaf.
pub fn locate_rightmost<T: TraversableTree + ?Sized>(tree: &T) -> Result<Option<TreePath>> {
    let Some(mut current) = tree.root_ref()? else {
        return Ok(None);
    };
    let mut path = TreePath::new();
    loop {
        let (internal, count) = {
            let page = tree.page(&current)?;
            (page.is_internal(), page.entries_count())
        };
        if !internal {
            path.push(PathFrame {
                page: current,
                index: count,
            });
            return Ok(Some(path));
        }
        if count == 0 {
            return Err(Error::InvariantViolation("internal page without entries"));
        }
        let child = tree.child(&current, count - 1)?;
        path.push(PathFrame {
            page: current,
            index: count - 1,
        });
        current = child;
    }
}

/// Greatest key of the tree. Pages emptied by deletes are skipped,
/// so the rightmost leaf does not have to hold it.
pub fn last_key<T: TraversableTree + ?Sized>(tree: &T) -> Result<Option<ByteView>> {
    match tree.root_ref()? {
        Some(root) => last_key_in(tree, root),
        None => Ok(None),
    }
}

fn last_key_in<T: TraversableTree + ?Sized>(tree: &T, page: PageRef) -> Result<Option<ByteView>> {
    let (internal, count) = {
        let p = tree.page(&page)?;
        (p.is_internal(), p.entries_count())
    };
    if !internal {
        if count == 0 {
            return Ok(None);
        }
        return tree.page(&page)?.key(count - 1).map(Some);
    }
    for idx in (0..count).rev() {
        let child = tree.child(&page, idx)?;
        if let Some(key) = last_key_in(tree, child)? {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

/// Point lookup.
#[inline]
pub fn get<T: TraversableTree + ?Sized>(tree: &T, key: &[u8]) -> Result<Option<ByteView>> {
    match locate(tree, key)? {
        Some((path, found)) if found >= 0 => {
            let Some(leaf) = path.last() else {
                return Ok(None);
            };
            tree.value(&leaf.page, found as usize).map(Some)
        }
        _ => Ok(None),
    }
}
