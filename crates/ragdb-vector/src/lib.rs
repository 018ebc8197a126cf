pub mod cache;
pub mod collection;
pub mod flat;
pub mod index;
pub mod ivf;
pub mod kmeans;
pub mod persist;
pub mod schema;
pub mod store;

pub use cache::{cache_key, normalize_query, CacheKey, CacheStats, RetrievalCache};
pub use collection::{Collection, CollectionState, CollectionWriter};
pub use index::{compute_nlist, IndexKind, IndexParams, VectorIndex};
pub use store::CollectionStore;
