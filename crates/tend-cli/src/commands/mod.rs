pub mod add;
pub mod clear;
pub mod common;
pub mod delete;
pub mod follow;
pub mod list;
pub mod rename;
pub mod room;
pub mod sync;
pub mod toggle;
