//! Configuration view and validation commands: `lessonforge config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;
use lessonforge::config::{LessonforgeConfig, LessonforgeToml};

pub fn cmd_config(
    project_dir: &Path,
    config: &LessonforgeConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("lessonforge Configuration");
            println!("=========================");
            println!();

            match &config.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No lessonforge.toml found; using defaults."),
            }
            println!();

            // Effective values, environment overrides included.
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            if config.source.is_none() {
                println!("Run 'lessonforge config init' to create a lessonforge.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if config.source.is_none() {
                println!("No lessonforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            let config_path = LessonforgeConfig::project_config_path(project_dir);
            if config_path.exists() {
                println!("lessonforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            LessonforgeToml::default().save(&config_path)?;

            println!("Created lessonforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] workers, task_timeout_secs, max_fragment_chars");
            println!("  - [engine.retry] max_attempts, base_delay_ms, max_delay_ms");
            println!("  - [generator] endpoint, api_key_env");
            println!();
        }
    }

    Ok(())
}
