//! In-process generation run: `lessonforge generate <topic-id>`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::open_store;
use lessonforge::config::LessonforgeConfig;
use lessonforge::engine::{Dispatcher, HttpGenerator, RunEvent, RunState, RunStatus};
use lessonforge::store::ArtifactStore;
use lessonforge::ui::GenerationUI;

pub async fn cmd_generate(
    project_dir: &Path,
    config: &LessonforgeConfig,
    topic_id: &str,
    verbose: bool,
    json: bool,
) -> Result<()> {
    let store: Arc<dyn ArtifactStore> = Arc::new(open_store(project_dir, config).await?);
    let dispatcher_config = config.dispatcher_config();
    let generator = HttpGenerator::new(
        &config.toml.generator.endpoint,
        config.toml.generator.api_key(),
        dispatcher_config.task_timeout,
    )
    .context("Failed to build generator client")?;

    let dispatcher = Dispatcher::start(dispatcher_config, store, Arc::new(generator));
    // Subscribe before submitting so RunStarted is not missed.
    let mut events = dispatcher.subscribe();
    let handle = dispatcher.submit(topic_id).await?;

    let ui = (!json).then(|| GenerationUI::new(topic_id, verbose));
    let mut cancelled = false;

    let status: RunStatus = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.run_id() == handle.run_id => {
                    match &ui {
                        Some(ui) => ui.handle(&event),
                        None => println!("{}", serde_json::to_string(&event)?),
                    }
                    if let RunEvent::RunFinished { status, .. } = event {
                        break *status;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break handle.wait().await,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                if let Err(e) = dispatcher.cancel(handle.run_id).await {
                    warn!(error = %e, "Cancel request failed");
                }
            }
        }
    };

    dispatcher.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string(&status)?);
    }
    match status.state {
        RunState::Completed => Ok(()),
        state => {
            let reasons: Vec<String> = status
                .failed_tasks
                .iter()
                .map(|f| format!("{}: {}", f.task, f.error))
                .collect();
            bail!(
                "Run {} ended {} ({}){}",
                status.run_id,
                state,
                status.summary(),
                if reasons.is_empty() {
                    String::new()
                } else {
                    format!("\n  {}", reasons.join("\n  "))
                }
            )
        }
    }
}
