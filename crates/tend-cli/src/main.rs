//! tend CLI - Command-line client for the replicated task list
//!
//! Every command works against the local replica; `sync` and `follow`
//! replicate it with a server.

mod cli;
mod commands;
mod config;
mod error;


use clap::{CommandFactory, Parser};

use cli::{Cli, Commands};
use commands::add::run_add;
use commands::clear::run_clear_completed;
use commands::delete::run_delete;
use commands::follow::run_follow;
use commands::list::run_list;
use commands::rename::run_rename;
use commands::room::run_room;
use commands::sync::run_sync;
use commands::toggle::run_toggle;
use config::ClientConfig;
use error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["tend=warn", "tend_core=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| CliError::Config(format!("invalid log directive: {e}")))?,
        );
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    if let Commands::Room { token } = &command {
        return run_room(token.as_deref());
    }

    let config = ClientConfig::resolve(cli.db_path, cli.server)?;
    let db_path = config.db_path.as_path();

    match command {
        Commands::Add { name } => run_add(&name, db_path).await?,
        Commands::List { all, json } => run_list(all, json, db_path).await?,
        Commands::Toggle { id } => run_toggle(&id, db_path).await?,
        Commands::Rename { id, name } => run_rename(&id, &name, db_path).await?,
        Commands::Delete { id } => run_delete(&id, db_path).await?,
        Commands::ClearCompleted => run_clear_completed(db_path).await?,
        Commands::Sync => run_sync(config.require_server()?, db_path).await?,
        Commands::Follow => run_follow(config.require_server()?, db_path).await?,
        Commands::Room { .. } => {}
    }

    Ok(())
}
