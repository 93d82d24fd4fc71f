use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use lessonforge::config::LessonforgeConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "lessonforge")]
#[command(version, about = "Lesson content generation orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a lessonforge.toml. Defaults to .lessonforge/lessonforge.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP content service
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides server.db_path)
        #[arg(long)]
        db_path: Option<String>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create, fill or inspect topics
    Topic {
        #[command(subcommand)]
        command: TopicCommands,
    },
    /// Run the content pipeline for a topic in-process
    Generate {
        topic_id: String,

        /// Print run events and the final status as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TopicCommands {
    /// Create a topic, or rename an existing one
    Create { id: String, title: String },
    /// Replace a topic's theory with the contents of a file
    Theory { id: String, file: PathBuf },
    /// Show a topic with its slides and quiz
    Show { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default lessonforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = LessonforgeConfig::load(&project_dir, cli.config.as_deref())?;
    let _log_guard = lessonforge::logging::init(&config.toml.logging, cli.verbose)?;
    for warning in &config.override_warnings {
        warn!("{}", warning);
    }

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            let config = config.with_port(port).with_db_path(db_path);
            cmd::cmd_serve(&project_dir, &config, dev).await?;
        }
        Commands::Topic { command } => cmd::cmd_topic(&project_dir, &config, command).await?,
        Commands::Generate { topic_id, json } => {
            cmd::cmd_generate(&project_dir, &config, &topic_id, cli.verbose, json).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command)?,
    }

    Ok(())
}
