use std::time::Duration;

use serde::Serialize;

/// Result of committing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Success,
    Failure(String),
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitOutcome::Success)
    }
}

/// Counters owned by the orchestrator for the duration of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total: u64,
    pub processed_count: u64,
    pub unprocessed_count: u64,
    pub elapsed: Duration,
}

impl BatchStats {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &CommitOutcome) {
        match outcome {
            CommitOutcome::Success => self.processed_count += 1,
            CommitOutcome::Failure(_) => self.unprocessed_count += 1,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.processed_count + self.unprocessed_count == self.total
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Images processed: {}, unprocessed: {}, processing time: {}",
            self.processed_count,
            self.unprocessed_count,
            format_elapsed(self.elapsed)
        )
    }
}

/// Formats a duration as `HH:MM:SS.mmm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_ms = elapsed.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1_000) % 60;
    let millis = total_ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}
