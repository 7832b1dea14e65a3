//! Out-of-core columnar storage for tabula
//!
//! This crate holds everything below the query layer: the value model, the
//! block codec, the block manager with its cache and file-handle pool, and
//! the segment, column and table abstractions built on top of them. All
//! storage state lives in an explicit [`StorageContext`] that callers pass
//! around.

#![warn(missing_docs)]

pub mod batch;
pub mod codec;
pub mod column;
pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod memory;
pub mod schema;
pub mod segment;
pub mod storage;
pub mod table;
pub mod value;

// Re-export key types for convenience
pub use batch::Batch;
pub use column::{Column, ColumnIter, ColumnWriter};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use index::{open_table, INDEX_FORMAT_VERSION};
pub use schema::{Field, Schema, SchemaRef};
pub use segment::{Segment, SegmentWriter};
pub use storage::{StorageContext, StorageRef};
pub use table::Table;
pub use value::{DataType, DateTime, NdArray, Value};

/// Memory budget and accounting functionality
pub mod budget {
    pub use crate::memory::MemoryBudget;
    pub use crate::memory::MemoryStats;
    pub use crate::memory::Reservation;
}
