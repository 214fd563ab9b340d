//! turnkeep CLI, the main entry point.
//!
//! Commands:
//! - `chat`          Talk to the engine from the terminal
//! - `serve`         Start the HTTP gateway
//! - `session show`  Print a stored session
//! - `session list`  List a user's sessions
//! - `config init`   Write a default config file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "turnkeep",
    about = "turnkeep: multi-turn context engine for LLM assistants",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TURNKEEP_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the engine
    Chat {
        /// Session to continue or start
        #[arg(short, long, default_value = "default")]
        session: String,

        /// User the session belongs to
        #[arg(short, long, default_value = "local", env = "TURNKEEP_USER")]
        user: String,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Start in a bypass mode
        #[arg(long)]
        mode: Option<String>,
    },

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect stored sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Print one session
    Show {
        id: String,

        #[arg(short, long, default_value = "local", env = "TURNKEEP_USER")]
        user: String,

        /// Print the raw session document
        #[arg(long)]
        json: bool,
    },

    /// List a user's sessions
    List {
        #[arg(short, long, default_value = "local", env = "TURNKEEP_USER")]
        user: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let logs = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.init();
    }

    match cli.command {
        Commands::Chat {
            session,
            user,
            message,
            mode,
        } => commands::chat::run(&user, &session, message, mode).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Session { command } => match command {
            SessionCommand::Show { id, user, json } => {
                commands::session::show(&user, &id, json).await?
            }
            SessionCommand::List { user } => commands::session::list(&user).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommand::Init { force } => commands::config_cmd::init(force)?,
            ConfigCommand::Show => commands::config_cmd::show()?,
            ConfigCommand::Path => commands::config_cmd::path(),
        },
    }

    Ok(())
}
