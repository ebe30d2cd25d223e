use std::path::Path;

use tend_core::{HttpMaster, PullStreamItem, ReplicationConfig, ReplicationState};

use crate::commands::common::{format_todo_line, open_replica, short_id};
use crate::error::CliError;

/// Replicate live, printing every change that lands locally, until ctrl-c.
pub async fn run_follow(server_url: &str, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path)?;
    let config = ReplicationConfig::default();
    let master = HttpMaster::with_timeout(server_url, config.request_timeout())?;

    let mut changes = replica.subscribe();
    let state = ReplicationState::start(replica.clone(), master, config)?;
    let mut errors = state.errors();
    println!("Following {server_url}; press Ctrl-C to stop");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            item = changes.recv() => match item {
                Some(PullStreamItem::Event(event)) => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    for todo in &event.documents {
                        if todo.deleted {
                            println!("{:<8}  deleted", short_id(todo));
                        } else {
                            println!("{}", format_todo_line(todo, now_ms));
                        }
                    }
                }
                Some(PullStreamItem::Resync) => changes = replica.subscribe(),
                None => break,
            },
            message = errors.recv() => {
                if let Ok(message) = message {
                    eprintln!("warning: {message}");
                }
            }
        }
    }

    tracing::info!("Stopping replication");
    state.cancel().await;
    Ok(())
}
