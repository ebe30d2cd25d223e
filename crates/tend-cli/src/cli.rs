use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tend")]
#[command(about = "A local-first task list that replicates through a server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file (defaults to $TEND_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Replication server base URL (defaults to $TEND_SERVER_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub server: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new todo
    #[command(alias = "new")]
    Add {
        /// Todo name
        name: Vec<String>,
    },
    /// List todos
    #[command(alias = "ls")]
    List {
        /// Include completed todos
        #[arg(short, long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Flip a todo between open and done
    Toggle {
        /// Todo ID or unique ID prefix
        id: String,
    },
    /// Rename a todo
    Rename {
        /// Todo ID or unique ID prefix
        id: String,
        /// New name
        name: Vec<String>,
    },
    /// Delete a todo
    #[command(alias = "rm")]
    Delete {
        /// Todo ID or unique ID prefix
        id: String,
    },
    /// Delete every completed todo
    ClearCompleted,
    /// Replicate once with the server and exit
    Sync,
    /// Replicate continuously with the server until interrupted
    Follow,
    /// Show the room id for a mesh token, generating a token when omitted
    Room {
        /// Shared room token
        token: Option<String>,
    },
}
