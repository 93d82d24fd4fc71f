//! Topic management commands: `lessonforge topic`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use super::super::TopicCommands;
use super::open_store;
use lessonforge::config::LessonforgeConfig;
use lessonforge::content::SlideStatus;
use lessonforge::content::validate::validate_topic_id;
use lessonforge::store::ArtifactStore;

pub async fn cmd_topic(
    project_dir: &Path,
    config: &LessonforgeConfig,
    command: TopicCommands,
) -> Result<()> {
    let store = open_store(project_dir, config).await?;

    match command {
        TopicCommands::Create { id, title } => {
            validate_topic_id(&id)?;
            let topic = store.put_topic(&id, &title).await?;
            println!("Topic {} saved: {}", style(&topic.id).yellow(), topic.title);
        }
        TopicCommands::Theory { id, file } => {
            let theory = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read theory file {}", file.display()))?;
            let topic = store.set_theory(&id, &theory).await?;
            println!(
                "Theory for {} replaced ({} chars)",
                style(&topic.id).yellow(),
                topic.theory_content.chars().count()
            );
        }
        TopicCommands::Show { id } => {
            let Some(topic) = store.get_topic(&id).await? else {
                bail!("Topic {} not found", id);
            };
            let slides = store.list_slides(&id).await?;
            let quiz = store.get_quiz(&id).await?;

            println!();
            println!("{} {}", style(&topic.id).bold(), topic.title);
            println!(
                "  theory: {} chars, updated {}",
                topic.theory_content.chars().count(),
                topic.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!("  slides: {}", slides.len());
            for unit in &slides {
                let Some(slide) = unit.slide() else { continue };
                let status = match slide.status {
                    SlideStatus::NarrativeReady => style(slide.status.as_str()).green(),
                    SlideStatus::Failed => style(slide.status.as_str()).red(),
                    _ => style(slide.status.as_str()).yellow(),
                };
                println!("    [{}] {} {}", slide.order, status, style(unit.id).dim());
                if let Some(reason) = &slide.failure {
                    println!("        {}", style(reason).dim());
                }
            }
            match quiz {
                Some(unit) => println!("  quiz: ready {}", style(unit.id).dim()),
                None => println!("  quiz: none"),
            }
            println!();
        }
    }

    Ok(())
}
