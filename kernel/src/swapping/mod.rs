pub mod page_replacement;
pub mod swap_table;

pub use swap_table::{SwapSlot, SwapTable, SECTORS_PER_PAGE};
