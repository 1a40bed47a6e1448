//! Database module for PostgreSQL persistence.

mod changes;
mod pool;
mod rows;

pub use changes::*;
pub use pool::*;
pub use rows::*;
