//! Background model-listing cache (spec.md §4.E): merges `list_models`
//! results across every (provider, credential) pair into a pointer-swapped
//! lookup table, refreshed on a timer.

mod cache;
mod table;

pub use cache::{ModelCache, ModelCacheConfig};
pub use table::ModelTable;
