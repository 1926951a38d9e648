//! Core types for the page cache.

mod byte_order;
mod ids;

pub use byte_order::ByteOrder;
pub use ids::{PageIndex, StorageId};
