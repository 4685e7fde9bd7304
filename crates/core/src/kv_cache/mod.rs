mod block_table;
mod cache;

pub use block_table::BlockTable;
pub use cache::KvCache;
