use std::path::Path;

use tend_core::{Todo, TodoState};

use crate::commands::common::{format_todo_lines, open_replica, todo_to_list_item, TodoListItem};
use crate::error::CliError;

pub async fn list_todos(include_done: bool, db_path: &Path) -> Result<Vec<Todo>, CliError> {
    let replica = open_replica(db_path)?;
    let mut todos = replica.list().await?;
    if !include_done {
        todos.retain(|todo| todo.state == TodoState::Open);
    }
    Ok(todos)
}

pub async fn run_list(include_done: bool, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let todos = list_todos(include_done, db_path).await?;

    if as_json {
        let json_items = todos
            .iter()
            .map(todo_to_list_item)
            .collect::<Vec<TodoListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_todo_lines(&todos) {
            println!("{line}");
        }
    }

    Ok(())
}
