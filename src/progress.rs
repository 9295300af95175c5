//! CLI-facing progress reporting for long indexing runs.
//!
//! This is separate from the DB-persisted `StepResult` journal (`models.rs`,
//! `store.rs`), which is the source of truth consumed by the HTTP API.
//! `StepProgressReporter` only emits ephemeral human/JSON progress to stderr
//! while a CLI-driven run is in flight, keeping that split from the
//! persisted checkpoint table.

use std::io::Write;

/// A single progress event for an indexing run.
#[derive(Clone, Debug)]
pub enum StepProgressEvent {
    /// A document has entered a pipeline step.
    StepStarted {
        document_id: String,
        step: String,
    },
    /// A document has finished a pipeline step.
    StepCompleted {
        document_id: String,
        step: String,
        duration_seconds: f64,
    },
    /// A document's step failed.
    StepFailed {
        document_id: String,
        step: String,
        message: String,
    },
    /// Run-level progress across documents, e.g. during the batched embedding step.
    RunProgress { run_id: String, n: u64, total: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait StepProgressReporter: Send + Sync {
    fn report(&self, event: StepProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl StepProgressReporter for StderrProgress {
    fn report(&self, event: StepProgressEvent) {
        let line = match &event {
            StepProgressEvent::StepStarted { document_id, step } => {
                format!("[{document_id}] {step}  starting...\n")
            }
            StepProgressEvent::StepCompleted {
                document_id,
                step,
                duration_seconds,
            } => {
                format!("[{document_id}] {step}  done in {duration_seconds:.2}s\n")
            }
            StepProgressEvent::StepFailed {
                document_id,
                step,
                message,
            } => {
                format!("[{document_id}] {step}  FAILED: {message}\n")
            }
            StepProgressEvent::RunProgress { run_id, n, total } => {
                format!(
                    "run {run_id}  embedding  {} / {} chunks\n",
                    format_number(*n),
                    format_number(*total)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StepProgressReporter for JsonProgress {
    fn report(&self, event: StepProgressEvent) {
        let obj = match &event {
            StepProgressEvent::StepStarted { document_id, step } => serde_json::json!({
                "event": "step_started",
                "document_id": document_id,
                "step": step,
            }),
            StepProgressEvent::StepCompleted {
                document_id,
                step,
                duration_seconds,
            } => serde_json::json!({
                "event": "step_completed",
                "document_id": document_id,
                "step": step,
                "duration_seconds": duration_seconds,
            }),
            StepProgressEvent::StepFailed {
                document_id,
                step,
                message,
            } => serde_json::json!({
                "event": "step_failed",
                "document_id": document_id,
                "step": step,
                "message": message,
            }),
            StepProgressEvent::RunProgress { run_id, n, total } => serde_json::json!({
                "event": "run_progress",
                "run_id": run_id,
                "n": n,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StepProgressReporter for NoProgress {
    fn report(&self, _event: StepProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StepProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
