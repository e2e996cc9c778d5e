pub mod backend;
pub mod filter;
pub mod memory;

pub use backend::MemoryBackend;
pub use filter::{FilterField, MemoryQuery, Predicate, SqlParam, parse_categories};
pub use memory::InMemoryBackend;
