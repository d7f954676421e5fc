//! Database layer for Outbox

mod connection;
mod memory;
mod migrations;
mod repository;

pub use connection::Database;
pub use memory::MemoryOperationStorage;
pub use repository::{LibSqlOperationStorage, OperationStorage};
