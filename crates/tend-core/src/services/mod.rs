//! Services layered over the storage layer

mod replica;

pub use replica::Replica;
