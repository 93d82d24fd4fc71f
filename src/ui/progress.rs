use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::engine::{RunEvent, RunState, RunStatus, TaskKind};
use crate::ui::icons::{CHECK, CROSS, QUIZ, RETRY, SLIDES, SPARKLE, STOP};

/// Terminal UI for one generation run, rendered via `indicatif`.
///
/// Three bars are stacked vertically:
/// - Phase spinner: the pipeline step currently executing
/// - HTML bar: slides rendered (or failed) out of the persisted set
/// - Narrative bar: slides narrated (or skipped) out of the persisted set
///
/// Slide bars are sized when the skeleton set is persisted.
pub struct GenerationUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    html_bar: ProgressBar,
    narrative_bar: ProgressBar,
    verbose: bool,
}

impl GenerationUI {
    pub fn new(topic_id: &str, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("     Run");
        phase_bar.set_message(format!("{} queued", style(topic_id).yellow()));
        phase_bar.enable_steady_tick(Duration::from_millis(100));

        let slide_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let html_bar = multi.add(ProgressBar::new(0));
        html_bar.set_style(slide_style.clone());
        html_bar.set_prefix("    HTML");

        let narrative_bar = multi.add(ProgressBar::new(0));
        narrative_bar.set_style(slide_style);
        narrative_bar.set_prefix("Narrated");

        Self {
            multi,
            phase_bar,
            html_bar,
            narrative_bar,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` when the
    /// terminal is unavailable.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Apply one dispatcher event to the display.
    pub fn handle(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { topic_id, .. } => {
                self.phase_bar
                    .set_message(format!("{} started", style(topic_id).yellow()));
            }
            RunEvent::TaskStarted {
                task,
                worker,
                attempt,
                ..
            } => {
                if task.slide_order().is_none() {
                    self.phase_bar.set_message(format!(
                        "{} {}",
                        style(task).cyan(),
                        style(format!("(worker {}, attempt {})", worker, attempt)).dim()
                    ));
                }
                if self.verbose {
                    self.print_line(format!(
                        "    {} {} on worker {}",
                        style("→").dim(),
                        task,
                        worker
                    ));
                }
            }
            RunEvent::TaskCompleted { task, .. } => match task {
                TaskKind::Html { .. } => self.html_bar.inc(1),
                TaskKind::Narrative { .. } => self.narrative_bar.inc(1),
                _ => self.print_line(format!("{}{} done", CHECK, task)),
            },
            RunEvent::TaskFailed { task, .. } => {
                match task {
                    // A slide without HTML never gets a narrative.
                    TaskKind::Html { .. } => {
                        self.html_bar.inc(1);
                        self.narrative_bar.inc(1);
                    }
                    TaskKind::Narrative { .. } => self.narrative_bar.inc(1),
                    _ => {}
                }
                if let Some(line) = event_line(event) {
                    self.print_line(line);
                }
            }
            RunEvent::SlidesPersisted { count, .. } => {
                let count = *count as u64;
                self.html_bar.set_length(count);
                self.narrative_bar.set_length(count);
                if let Some(line) = event_line(event) {
                    self.print_line(line);
                }
            }
            RunEvent::TaskRetrying { .. } => {
                if let Some(line) = event_line(event) {
                    self.print_line(line);
                }
            }
            RunEvent::RunFinished { status, .. } => self.finish(status),
        }
    }

    /// Stop all bars and print the outcome.
    pub fn finish(&self, status: &RunStatus) {
        self.phase_bar.disable_steady_tick();
        let icon = match status.state {
            RunState::Completed => SPARKLE,
            RunState::Cancelled => STOP,
            RunState::Failed | RunState::Running => CROSS,
        };
        self.phase_bar
            .finish_with_message(format!("{}{} ({})", icon, status.state, status.summary()));
        self.html_bar.finish();
        self.narrative_bar.finish();
    }
}

/// The log line printed for an event, if it warrants one.
pub fn event_line(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::TaskRetrying {
            task,
            attempt,
            delay_ms,
            reason,
            ..
        } => Some(format!(
            "{}{} attempt {} failed, retrying in {}ms: {}",
            RETRY, task, attempt, delay_ms, reason
        )),
        RunEvent::TaskFailed { task, reason, .. } => {
            let icon = if matches!(task, TaskKind::Quiz) {
                QUIZ
            } else {
                CROSS
            };
            Some(format!("{}{} failed: {}", icon, task, reason))
        }
        RunEvent::SlidesPersisted { count, .. } => {
            Some(format!("{}{} slide skeletons persisted", SLIDES, count))
        }
        _ => None,
    }
}
