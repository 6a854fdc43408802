//! idxd-catalog: a live, incrementally maintained media catalog.
//!
//! Mirrors an external media source into an identity-mapped table of records,
//! keeps it in sync from debounced change notifications, and maintains sorted,
//! capacity-bounded views over it that report changes as index ranges.

pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod runtime;
pub mod source;
pub mod views;

pub use catalog::{CatalogBuilder, MediaCatalog, RecordEvent};
pub use config::CatalogConfig;
pub use error::{CatalogError, CatalogResult, SourceError, SourceResult};
pub use models::{Container, MediaFlags, MediaId, MediaKind, MediaRecord, MediaRow};
pub use runtime::{DeliveryContext, Handle, LoopContext};
pub use source::{DirectorySource, Locator, MediaSource, MemorySource};
pub use views::{MaterializedView, MediaFilter, SortOrder, ViewChange, ViewSpec};
