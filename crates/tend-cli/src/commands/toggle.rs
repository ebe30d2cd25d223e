use std::path::Path;

use tend_core::TodoState;

use crate::commands::common::{open_replica, resolve_todo};
use crate::error::CliError;

pub async fn run_toggle(id: &str, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path)?;
    let todo = resolve_todo(id, &replica).await?;

    let toggled = replica.toggle(&todo.id).await?;
    let label = match toggled.state {
        TodoState::Done => "done",
        TodoState::Open => "open",
    };
    println!("{} {label}", toggled.id);
    Ok(())
}
