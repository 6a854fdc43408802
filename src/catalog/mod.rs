//! The catalog engine and the components that run on its worker.
//!
//! - `broker` - serialized source access
//! - `observer` - debounced change notifications
//! - `table` - identity-mapped records and set-difference sync
//! - `activation` - ref-counted start/stop with delayed teardown
//! - `discovery` - grouping containers
//! - `engine` - `MediaCatalog`, the facade tying them together

pub mod activation;
pub mod broker;
pub mod discovery;
pub mod engine;
pub mod observer;
pub mod table;

pub use activation::ActivationGate;
pub use broker::ContentBroker;
pub use discovery::{DiscoveryOutcome, SetDiscovery};
pub use engine::{CatalogBuilder, CatalogStats, MediaCatalog};
pub use observer::{ChangeCallback, ChangeObserverHub, HubStats};
pub use table::{CatalogTable, Lookup, Obtained, RecordEvent, SyncOutcome, TableStats};
