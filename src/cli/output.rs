//! CLI output formatting

use crate::core::ExecutionStatus;
use crate::execution::PipelineEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "+ ");

/// Create a spinner for an operation of unknown length
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed}] {msg}")
            .unwrap(),
    );
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Spinners for the image pulls in flight
#[derive(Debug, Default)]
pub struct PullProgress {
    spinners: Mutex<HashMap<String, ProgressBar>>,
}

impl PullProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or finish a spinner for pull events; other events are ignored
    pub fn on_event(&self, event: &PipelineEvent) {
        let Ok(mut spinners) = self.spinners.lock() else {
            return;
        };
        match event {
            PipelineEvent::ImagePullStarted { image } => {
                let spinner = create_spinner(format!("Pulling {}", style(image).cyan()));
                spinners.insert(image.clone(), spinner);
            }
            PipelineEvent::ImagePulled { image } => {
                if let Some(spinner) = spinners.remove(image) {
                    spinner.finish_and_clear();
                }
            }
            _ => {}
        }
    }

    /// Number of pulls still running
    pub fn in_flight(&self) -> usize {
        self.spinners.lock().map(|spinners| spinners.len()).unwrap_or(0)
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format a run event for display. Events rendered elsewhere return `None`.
pub fn format_pipeline_event(event: &PipelineEvent) -> Option<String> {
    let line = match event {
        PipelineEvent::RunStarted { run_id } => format!(
            "{} Starting run {}",
            ROCKET,
            style(&run_id.to_string()[..8]).dim()
        ),
        PipelineEvent::RepositoryCloning { name, location } => format!(
            "{} Cloning {} from {}",
            PACKAGE,
            style(name).bold(),
            style(location).dim()
        ),
        PipelineEvent::ServiceStarted { name, container_id } => format!(
            "{} Service {} started ({})",
            INFO,
            style(name).cyan(),
            style(short_id(container_id)).dim()
        ),
        PipelineEvent::ServiceStopped { name } => {
            format!("{} Service {} stopped", INFO, style(name).dim())
        }
        PipelineEvent::StepStarted { name, index, total } => format!(
            "{} [{}/{}] {}",
            SPINNER,
            style(index).cyan(),
            style(total).dim(),
            style(name).bold()
        ),
        PipelineEvent::StepFinished { name, success: true } => {
            format!("{} {}", CHECK, style(name).green())
        }
        PipelineEvent::StepFinished { name, success: false } => {
            format!("{} {}", CROSS, style(name).red())
        }
        PipelineEvent::RunFinished { run_id, status } => format!(
            "{} Run ({}) {}",
            INFO,
            style(&run_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
        PipelineEvent::StageStarted { .. }
        | PipelineEvent::ImagePullStarted { .. }
        | PipelineEvent::ImagePulled { .. } => return None,
    };
    Some(line)
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStage;
    use uuid::Uuid;

    #[test]
    fn test_step_events_render() {
        let started = format_pipeline_event(&PipelineEvent::StepStarted {
            name: "build".to_string(),
            index: 2,
            total: 3,
        })
        .unwrap();
        assert!(started.contains("build"));
        assert!(started.contains('2'));

        let failed = format_pipeline_event(&PipelineEvent::StepFinished {
            name: "test".to_string(),
            success: false,
        })
        .unwrap();
        assert!(failed.contains("test"));
    }

    #[test]
    fn test_stage_and_pull_events_are_silent() {
        assert!(format_pipeline_event(&PipelineEvent::StageStarted { stage: RunStage::Steps }).is_none());
        assert!(format_pipeline_event(&PipelineEvent::ImagePulled { image: "alpine".to_string() }).is_none());
    }

    #[test]
    fn test_run_events_show_short_id() {
        let run_id = Uuid::new_v4();
        let line = format_pipeline_event(&PipelineEvent::RunStarted { run_id }).unwrap();
        assert!(line.contains(&run_id.to_string()[..8]));
        assert!(!line.contains(&run_id.to_string()));
    }

    #[test]
    fn test_service_id_is_shortened() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_pull_progress_tracks_spinners() {
        let progress = PullProgress::new();
        progress.on_event(&PipelineEvent::ImagePullStarted { image: "alpine".to_string() });
        progress.on_event(&PipelineEvent::ImagePullStarted { image: "rust:1".to_string() });
        assert_eq!(progress.in_flight(), 2);

        progress.on_event(&PipelineEvent::ImagePulled { image: "alpine".to_string() });
        assert_eq!(progress.in_flight(), 1);
    }
}
