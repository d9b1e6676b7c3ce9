//! kmirror store: the indexed in-RAM mirror, the per-key delta queue that
//! feeds it, and read-only listers over it.

#![forbid(unsafe_code)]

mod indexer;
mod lister;
mod queue;

pub use indexer::{namespace_index, Applied, IndexFunc, IndexValues, Indexer, NAMESPACE_INDEX};
pub use lister::{Lister, NamespaceLister};
pub use queue::{DeltaQueue, Popped, QueueItem, Window};
