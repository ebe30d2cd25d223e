use std::path::Path;

use crate::commands::common::{normalize_name, open_replica, resolve_todo};
use crate::error::CliError;

pub async fn run_rename(id: &str, name_parts: &[String], db_path: &Path) -> Result<(), CliError> {
    let name = normalize_name(name_parts)?;
    let replica = open_replica(db_path)?;
    let todo = resolve_todo(id, &replica).await?;

    if todo.name == name {
        println!("{}", todo.id);
        return Ok(());
    }

    let renamed = replica.rename(&todo.id, &name).await?;
    println!("{}", renamed.id);
    Ok(())
}
