use std::path::Path;

use crate::commands::common::{open_replica, resolve_todo};
use crate::error::CliError;

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path)?;
    let todo = resolve_todo(id, &replica).await?;

    replica.delete(&todo.id).await?;
    println!("{}", todo.id);
    Ok(())
}
