use bridgebot::daemon::{self, DaemonOptions};
use bridgebot::gateway::rest::DiscordRest;
use bridgebot::ide::ComposerStore;
use bridgebot::registry::MappingRegistry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bridgebot", version, about = "Mirror IDE agent conversations into Discord threads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge daemon for a workspace.
    Start {
        /// Workspace root (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Verbose logging.
        #[arg(long)]
        debug: bool,
        /// Override the per-workspace state directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Register this tool-protocol adapter with the IDE.
        #[arg(long)]
        adapter: Option<PathBuf>,
    },
    /// Print discovery and connectivity diagnostics.
    Doctor {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            workspace,
            debug,
            state_dir,
            adapter,
        } => {
            let workspace = workspace.unwrap_or(std::env::current_dir()?);
            let instance = state_dir
                .clone()
                .unwrap_or_else(|| daemon::instance_dir(&workspace));
            std::fs::create_dir_all(instance.join("logs"))?;
            daemon::init_tracing(debug, Some(&instance.join("logs")));

            daemon::run(DaemonOptions {
                workspace,
                state_dir,
                adapter_path: adapter,
            })
            .await
        }
        Command::Doctor { workspace } => {
            daemon::init_tracing(false, None);
            doctor(workspace.unwrap_or(std::env::current_dir()?)).await
        }
    }
}

/// Setup diagnostics: where state lives, whether the IDE store is
/// discoverable, and whether the bot credential works.
async fn doctor(workspace: PathBuf) -> anyhow::Result<()> {
    let workspace = workspace.canonicalize().unwrap_or(workspace);
    println!("workspace:        {}", workspace.display());

    let instance = daemon::instance_dir(&workspace);
    println!("instance dir:     {}", instance.display());

    match ComposerStore::discover_state_db(&workspace) {
        Ok(db) => println!("IDE state db:     {}", db.display()),
        Err(error) => println!("IDE state db:     NOT FOUND ({error})"),
    }

    let token = match MappingRegistry::open(&instance.join("state.redb")) {
        Ok(registry) => bridgebot::config::bot_token(registry.load_bot_token()?),
        Err(error) => {
            println!("state store:      unreadable ({error})");
            bridgebot::config::bot_token(None)
        }
    };

    match token {
        None => println!("bot credential:   missing (set DISCORD_BOT_TOKEN)"),
        Some(token) => {
            let rest = DiscordRest::new(token);
            match rest.current_user().await {
                Ok(user) => {
                    let id = user["id"].as_str().unwrap_or("?");
                    let name = user["username"].as_str().unwrap_or("?");
                    println!("bot credential:   ok ({name}, id {id})");
                    println!("invite url:       {}", bridgebot::config::invite_url(id));
                }
                Err(error) => println!("bot credential:   rejected ({error})"),
            }
        }
    }

    Ok(())
}
