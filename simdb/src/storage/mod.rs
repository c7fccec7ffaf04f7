pub mod chunk;
pub mod column;

pub use chunk::{slot_of, CHUNK_SLOTS};
pub use column::{BoxedColumn, ColumnMeta, ColumnOps, PlainColumn, TypedColumn};

