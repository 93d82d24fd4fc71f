//! Content service command: `lessonforge serve`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use lessonforge::config::LessonforgeConfig;
use lessonforge::engine::HttpGenerator;
use lessonforge::service::{ServerConfig, start_server};

use super::resolve_db_path;

pub async fn cmd_serve(project_dir: &Path, config: &LessonforgeConfig, dev: bool) -> Result<()> {
    let dispatcher = config.dispatcher_config();
    let generator = HttpGenerator::new(
        &config.toml.generator.endpoint,
        config.toml.generator.api_key(),
        dispatcher.task_timeout,
    )
    .context("Failed to build generator client")?;

    start_server(
        ServerConfig {
            port: config.toml.server.port,
            db_path: resolve_db_path(project_dir, config),
            dev_mode: dev,
            dispatcher,
        },
        Arc::new(generator),
    )
    .await
}
