use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tend_core::{Replica, Todo, TodoState};

use crate::error::CliError;

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Serialize)]
pub struct TodoListItem {
    pub id: String,
    pub name: String,
    pub done: bool,
    pub last_change: i64,
    pub relative_time: String,
}

pub fn open_replica(path: &Path) -> Result<Replica, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Replica::open_path(path)?)
}

pub fn normalize_name(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let name = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(CliError::EmptyName);
    }
    Ok(name)
}

pub fn normalize_todo_identifier(raw: &str) -> Result<String, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyTodoId);
    }
    Ok(trimmed.to_string())
}

/// Find a visible todo by exact id or unique id prefix.
pub async fn resolve_todo(query: &str, replica: &Replica) -> Result<Todo, CliError> {
    let query = normalize_todo_identifier(query)?;
    if let Some(todo) = replica.get(&query.as_str().into()).await? {
        return Ok(todo);
    }

    let mut matching = replica
        .list()
        .await?
        .into_iter()
        .filter(|todo| todo.id.as_str().starts_with(&query))
        .collect::<Vec<_>>();

    match matching.len() {
        0 => Err(CliError::TodoNotFound(query)),
        1 => Ok(matching.remove(0)),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|todo| short_id(todo))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousTodoId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(todo: &Todo) -> String {
    todo.id.as_str().chars().take(SHORT_ID_LEN).collect()
}

pub fn format_todo_line(todo: &Todo, now_ms: i64) -> String {
    let mark = match todo.state {
        TodoState::Done => "x",
        TodoState::Open => " ",
    };
    format!(
        "{:<8}  [{mark}] {:<40}  {}",
        short_id(todo),
        todo.name,
        format_relative_time(todo.last_change, now_ms)
    )
}

pub fn format_todo_lines(todos: &[Todo]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    todos
        .iter()
        .map(|todo| format_todo_line(todo, now_ms))
        .collect()
}

pub fn todo_to_list_item(todo: &Todo) -> TodoListItem {
    let now_ms = Utc::now().timestamp_millis();
    TodoListItem {
        id: todo.id.to_string(),
        name: todo.name.clone(),
        done: todo.state == TodoState::Done,
        last_change: todo.last_change,
        relative_time: format_relative_time(todo.last_change, now_ms),
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
            || timestamp_ms.to_string(),
            |date_time| date_time.format("%Y-%m-%d").to_string(),
        )
    }
}
