//! formgen - operator CLI for the form schema engine
//!
//! Manages the form catalog, previews and publishes table generations,
//! and inspects the registry, aliases and publish journal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use formgen_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::config::EngineConfig;
use cli::context::Engine;

#[derive(Parser, Debug)]
#[command(name = "formgen", version, about = "Dynamic schema generation and versioning for forms")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: $FORMGEN_HOME/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overriding the config file
    #[arg(long, global = true, env = "FORMGEN_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage forms
    Form {
        #[command(subcommand)]
        action: cli::form::FormAction,
    },

    /// Manage form versions
    Version {
        #[command(subcommand)]
        action: cli::version::VersionAction,
    },

    /// Show the DDL a version would publish, without running it
    Ddl(cli::ddl::DdlArgs),

    /// Publish the latest version of a form
    Publish {
        /// Form key or ID
        form: String,
    },

    /// Show where a form's records live
    Resolve {
        /// Form key
        form: String,
    },

    /// Show a form's registry history and publish attempts
    History {
        /// Form key or ID
        form: String,
    },

    /// Repair cached form state and list interrupted publishes
    Reconcile {
        /// Only this form (key or ID)
        #[arg(long)]
        form: Option<String>,
    },

    /// Page through the active records of a form
    Rows(cli::rows::RowsArgs),

    /// Show the resolved configuration
    Config {
        /// Write the resolved configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn run_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(cli::config::default_config_path);
    let mut config = EngineConfig::load(&config_path)?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let json = cli.json;
    let command = cli.command;

    if let Commands::Config { save } = command {
        return cli::config::run(&config, &config_path, save, json);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let engine = Engine::open(&config).await?;
        let result = match command {
            Commands::Form { action } => cli::form::run(&engine, action, json).await,
            Commands::Version { action } => cli::version::run(&engine, action, json).await,
            Commands::Ddl(args) => cli::ddl::run(&engine, args, json).await,
            Commands::Publish { form } => cli::publish::run_publish(&engine, &form, json).await,
            Commands::Resolve { form } => cli::publish::run_resolve(&engine, &form, json).await,
            Commands::History { form } => cli::publish::run_history(&engine, &form, json).await,
            Commands::Reconcile { form } => {
                cli::publish::run_reconcile(&engine, form.as_deref(), json).await
            }
            Commands::Rows(args) => cli::rows::run(&engine, args, json).await,
            Commands::Config { .. } => Ok(()),
        };
        engine.close().await;
        result
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;

    if let Err(err) = init_logging(LogConfig {
        app_name: "formgen",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: logging disabled: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else {
                eprintln!("{:?}", err);
            }
            ExitCode::from(1)
        }
    }
}
