use std::path::Path;

use crate::commands::common::open_replica;
use crate::error::CliError;

pub async fn run_clear_completed(db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path)?;
    let cleared = replica.clear_completed().await?;

    match cleared.len() {
        0 => println!("No completed todos."),
        1 => println!("Cleared 1 completed todo."),
        n => println!("Cleared {n} completed todos."),
    }
    Ok(())
}
