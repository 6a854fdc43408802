pub mod container;
pub mod flag_store;
pub mod media_item;

pub use container::*;
pub use flag_store::*;
pub use media_item::*;
