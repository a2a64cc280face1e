//! On-disk storage: recorded bodies and the persisted index

mod content;
mod index_file;

pub use content::{write_atomic, ContentStore};
pub use index_file::IndexFile;
