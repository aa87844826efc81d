//! Copy-on-write B+Tree stored in the log.
//!
//! An [`ImmutableTree`] is a snapshot identified by the address of
//! its root page. A [`MutableTree`] copies pages on first write
//! and writes a new version of every changed page on save.
pub mod cursor;
pub mod expired;
pub mod immutable;
pub mod mutable;
pub mod page;
pub mod traversable;

pub use cursor::{CursorRegistry, TreeCursor};
pub use expired::ExpiredLoggableCollection;
pub use immutable::{AddressIterator, ImmutableTree};
pub use mutable::{MutableTree, TreeState};
pub use page::{ImmutablePage, KeySlot, PageKind};
pub use traversable::{PageRef, TraversablePage, TraversableTree};

use crate::journal::loggable::LoggableType;

pub const LEAF_PAGE: LoggableType = 0x10;
pub const INTERNAL_PAGE: LoggableType = 0x11;
pub const LEAF_ROOT_PAGE: LoggableType = 0x12;
pub const INTERNAL_ROOT_PAGE: LoggableType = 0x13;
/// Standalone key, referenced from pages when too long to embed.
pub const KEY_NODE: LoggableType = 0x14;
/// Value of a leaf entry.
pub const VALUE_NODE: LoggableType = 0x15;

/// Returns whether loggable type is one of the page types.
#[inline]
pub fn is_page_type(ty: LoggableType) -> bool {
    matches!(
        ty,
        LEAF_PAGE | INTERNAL_PAGE | LEAF_ROOT_PAGE | INTERNAL_ROOT_PAGE
    )
}
