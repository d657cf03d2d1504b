//! Flow key parsing and the data flow slot table

mod key;
mod table;

pub use key::*;
pub use table::*;
