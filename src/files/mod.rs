//! File hierarchy (spec.md §4.G): virtual-path resolution, folder types,
//! dropbox ACL inheritance, sidecar metadata, the on-disk search index, and
//! directory-subscription fanout.

pub mod events;
pub mod index;
pub mod tree;

pub use events::DirectoryEvents;
pub use index::{IndexReader, IndexWriter};
pub use tree::{EntryType, FileEntry, FileTree};
