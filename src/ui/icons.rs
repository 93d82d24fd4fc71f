//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static SLIDES: Emoji<'_, '_> = Emoji("🖼️  ", "[S]");
pub static QUIZ: Emoji<'_, '_> = Emoji("📝 ", "[Q]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");
