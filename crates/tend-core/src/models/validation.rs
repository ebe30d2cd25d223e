//! Record validation applied before writes reach a store

use super::todo::MAX_ID_LEN;
use super::Todo;
use crate::error::{Error, Result};

/// Upper bound for `last_change` accepted from any writer
pub const MAX_LAST_CHANGE: i64 = 2_701_307_494_132;

/// Checks a record before it is written.
pub trait TodoValidator: Send + Sync {
    fn validate(&self, todo: &Todo) -> Result<()>;
}

/// Default rules: non-empty id of at most 20 bytes and a timestamp within
/// `[0, MAX_LAST_CHANGE]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl TodoValidator for SchemaValidator {
    fn validate(&self, todo: &Todo) -> Result<()> {
        let id = todo.id.as_str();
        if id.is_empty() {
            return Err(Error::Validation("id must not be empty".to_string()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(Error::Validation(format!(
                "id {id:?} exceeds {MAX_ID_LEN} bytes"
            )));
        }
        if !(0..=MAX_LAST_CHANGE).contains(&todo.last_change) {
            return Err(Error::Validation(format!(
                "lastChange {} of {id:?} is out of range",
                todo.last_change
            )));
        }
        Ok(())
    }
}
