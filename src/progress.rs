//! Ingest and enrichment progress reporting.
//!
//! The pipelines report an indeterminate phase while schemas are being
//! discovered and imported, then switch to a determinate phase once the
//! amount of remaining work is known (row counts for enrichment, table
//! counts for the log import). Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives progress from the pipelines.
///
/// Mirrors the host framework's progress contract: an indeterminate phase
/// with a label, or a determinate phase with a fixed total advanced one
/// unit at a time. The reported counter is non-decreasing within a phase.
pub trait ProgressReporter: Send + Sync {
    /// Enter an indeterminate phase (total unknown).
    fn switch_to_indeterminate(&self, phase: &str);

    /// Enter a determinate phase with a fixed total.
    fn switch_to_determinate(&self, total: u64);

    /// Advance the determinate counter to `n` (1-based, non-decreasing).
    fn progress(&self, n: u64);
}

/// Human-friendly progress on stderr: "enriching  2 / 14".
pub struct StderrProgress {
    phase: std::sync::Mutex<String>,
    total: AtomicU64,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            phase: std::sync::Mutex::new(String::new()),
            total: AtomicU64::new(0),
        }
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for StderrProgress {
    fn switch_to_indeterminate(&self, phase: &str) {
        *self.phase.lock().unwrap() = phase.to_string();
        let line = format!("{}...\n", phase);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn switch_to_determinate(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn progress(&self, n: u64) {
        let total = self.total.load(Ordering::SeqCst);
        let phase = self.phase.lock().unwrap().clone();
        let line = format!(
            "{}  {} / {}\n",
            phase,
            format_number(n),
            format_number(total)
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress {
    phase: std::sync::Mutex<String>,
    total: AtomicU64,
}

impl JsonProgress {
    pub fn new() -> Self {
        Self {
            phase: std::sync::Mutex::new(String::new()),
            total: AtomicU64::new(0),
        }
    }
}

impl Default for JsonProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for JsonProgress {
    fn switch_to_indeterminate(&self, phase: &str) {
        *self.phase.lock().unwrap() = phase.to_string();
        let obj = serde_json::json!({
            "event": "progress",
            "phase": phase,
            "mode": "indeterminate"
        });
        emit_json(&obj);
    }

    fn switch_to_determinate(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        let obj = serde_json::json!({
            "event": "progress",
            "phase": self.phase.lock().unwrap().clone(),
            "mode": "determinate",
            "total": total
        });
        emit_json(&obj);
    }

    fn progress(&self, n: u64) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": self.phase.lock().unwrap().clone(),
            "n": n,
            "total": self.total.load(Ordering::SeqCst)
        });
        emit_json(&obj);
    }
}

fn emit_json(obj: &serde_json::Value) {
    if let Ok(line) = serde_json::to_string(obj) {
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
        let _ = std::io::stderr().lock().flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn switch_to_indeterminate(&self, _phase: &str) {}
    fn switch_to_determinate(&self, _total: u64) {}
    fn progress(&self, _n: u64) {}
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

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new()),
            ProgressMode::Json => Box::new(JsonProgress::new()),
        }
    }
}
