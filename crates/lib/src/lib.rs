//! Shared leaf types for stratadb.
//!
//! Everything here is plain data: object identities, schema descriptors,
//! portable column values, the fragment payload codec and the per-fragment
//! index. The object manager in `stratadb-core` moves these around; nothing
//! in this crate touches storage.

pub mod bloom;
pub mod index;
pub mod object_id;
pub mod payload;
pub mod schema;
pub mod value;

pub use bloom::BloomFilter;
pub use index::{filter_objects, IndexSettings, ObjectIndex, Qual, QualOp, Quals};
pub use object_id::{ObjectId, ObjectIdError};
pub use payload::{DeltaRow, FragmentPayload, PayloadError};
pub use schema::{ColumnSchema, ColumnType, TableSchema};
pub use value::{Row, Value};
