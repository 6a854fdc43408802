pub mod materialized;
pub mod sorted_list;

pub use materialized::{MaterializedView, MediaFilter, SortOrder, ViewSpec};
pub use sorted_list::{Comparator, Keyed, SortedList, ViewChange};
