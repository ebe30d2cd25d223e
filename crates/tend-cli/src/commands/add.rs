use std::path::Path;

use crate::commands::common::{normalize_name, open_replica};
use crate::error::CliError;

pub async fn run_add(name_parts: &[String], db_path: &Path) -> Result<(), CliError> {
    let name = normalize_name(name_parts)?;

    let replica = open_replica(db_path)?;
    let todo = replica.insert(&name).await?;

    println!("{}", todo.id);
    Ok(())
}
