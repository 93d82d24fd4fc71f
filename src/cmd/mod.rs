//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `topic`         | `Topic create`, `Topic theory`, `Topic show`       |
//! | `generate`      | `Generate`                                         |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod generate;
pub mod serve;
pub mod topic;

pub use config::cmd_config;
pub use generate::cmd_generate;
pub use serve::cmd_serve;
pub use topic::cmd_topic;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use lessonforge::config::LessonforgeConfig;
use lessonforge::store::LibsqlStore;

/// Database path from config, relative paths anchored at the project dir.
/// `:memory:` passes through untouched.
pub fn resolve_db_path(project_dir: &Path, config: &LessonforgeConfig) -> PathBuf {
    let path = PathBuf::from(&config.toml.server.db_path);
    if path.is_absolute() || config.toml.server.db_path == ":memory:" {
        path
    } else {
        project_dir.join(path)
    }
}

pub async fn open_store(project_dir: &Path, config: &LessonforgeConfig) -> Result<LibsqlStore> {
    let db_path = resolve_db_path(project_dir, config);
    LibsqlStore::new_local(&db_path)
        .await
        .with_context(|| format!("Failed to open content database {}", db_path.display()))
}
