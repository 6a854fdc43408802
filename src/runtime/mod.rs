//! Execution primitives for the catalog engine.
//!
//! - `Handle` - one-shot release tokens
//! - `WorkerThread` - the serial content thread
//! - `DeliveryContext` / `Subscribers` - thread-affine callback fan-out

pub mod delivery;
pub mod handle;
pub mod worker;

pub use delivery::{deliver, Callback, DeliveryContext, LoopContext, Subscribers};
pub use handle::Handle;
pub use worker::{Job, TaskId, WorkerThread};
