//! Pixferry metadata layer
//!
//! The local [`MetaStore`] (embedded SQLite) is the source of truth for every
//! pipeline decision. The [`MetaStoreMirror`] replicates committed changes to
//! a remote hosted store for reporting; it consumes the store's change feed
//! and the store knows nothing about it. The [`HashIndex`] answers
//! "have I seen this content before" in O(1), warmed from the store on start.

pub mod change;
pub mod hash_index;
pub mod mirror;
pub mod store;

pub use change::Change;
pub use hash_index::{HashIndex, Observed};
pub use mirror::{MetaStoreMirror, MirrorConfig};
pub use store::{FileUpdate, MetaStore};
