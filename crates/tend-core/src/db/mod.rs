//! Storage layer for tend

mod connection;
mod memory;
mod migrations;
mod repository;

pub use connection::Database;
pub use memory::MemoryTodoStore;
pub use repository::{SqliteTodoStore, TodoStore};
