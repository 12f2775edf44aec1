//! Cartsync CLI - manage the local shopping list and try the synchronizer

mod cli;
mod commands;
mod error;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::common::{load_settings, open_store, resolve_db_path};
use crate::commands::demo::run_demo;
use crate::commands::list::run_list;
use crate::commands::remove::run_remove;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cartsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    let db_path = resolve_db_path(cli.db_path, &settings);

    match cli.command {
        Some(Commands::Add(command)) => run_add(command, &open_store(&db_path)?)?,
        Some(Commands::List { json }) => run_list(&open_store(&db_path)?, json)?,
        Some(Commands::Remove { kind, id }) => {
            run_remove(&open_store(&db_path)?, kind.into(), id)?;
        }
        Some(Commands::Demo) => run_demo(&settings).await?,
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
