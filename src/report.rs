//! Structured progress reporting: plain text, JSON Lines, or nothing.

use std::io::Write;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde_json::json;

use nbc_api::error::NbcError;

pub trait Reporter: Send + Sync {
    fn step(&self, step: usize, total_steps: usize, step_name: &str);
    fn progress(&self, percent: u8, message: &str);
    fn message(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, error: &NbcError, message: &str);
    fn complete(&self, message: &str, details: Option<serde_json::Value>);
}

/// Human-oriented output on stderr, leaving stdout for data.
#[derive(Debug, Default)]
pub struct TextReporter;

impl Reporter for TextReporter {
    fn step(&self, step: usize, total_steps: usize, step_name: &str) {
        eprintln!("[{step}/{total_steps}] {step_name}");
    }

    fn progress(&self, percent: u8, message: &str) {
        eprintln!("  {percent:>3}% {message}");
    }

    fn message(&self, message: &str) {
        eprintln!("{message}");
    }

    fn warning(&self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn error(&self, error: &NbcError, message: &str) {
        eprintln!("error: {message}\n{error:?}");
    }

    fn complete(&self, message: &str, _details: Option<serde_json::Value>) {
        eprintln!("{message}");
    }
}

/// One JSON object per line, `type` + UTC `timestamp` plus event fields.
pub struct JsonLinesReporter<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        JsonLinesReporter {
            out: Mutex::new(std::io::stdout()),
        }
    }
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        JsonLinesReporter {
            out: Mutex::new(out),
        }
    }

    fn emit(&self, mut event: serde_json::Value) {
        event["timestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let mut out = self.out.lock().unwrap();
        if let Err(e) = writeln!(out, "{event}") {
            warn!("Failed to emit progress event: {e}");
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap()
    }
}

impl<W: Write + Send> Reporter for JsonLinesReporter<W> {
    fn step(&self, step: usize, total_steps: usize, step_name: &str) {
        self.emit(json!({
            "type": "step",
            "step": step,
            "total_steps": total_steps,
            "step_name": step_name,
        }));
    }

    fn progress(&self, percent: u8, message: &str) {
        self.emit(json!({
            "type": "progress",
            "percent": percent,
            "message": message,
        }));
    }

    fn message(&self, message: &str) {
        self.emit(json!({ "type": "message", "message": message }));
    }

    fn warning(&self, message: &str) {
        self.emit(json!({ "type": "warning", "message": message }));
    }

    fn error(&self, error: &NbcError, message: &str) {
        self.emit(json!({
            "type": "error",
            "message": message,
            "details": error,
        }));
    }

    fn complete(&self, message: &str, details: Option<serde_json::Value>) {
        self.emit(json!({
            "type": "complete",
            "message": message,
            "details": details,
        }));
    }
}

/// Swallows everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn step(&self, _step: usize, _total_steps: usize, _step_name: &str) {}
    fn progress(&self, _percent: u8, _message: &str) {}
    fn message(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _error: &NbcError, _message: &str) {}
    fn complete(&self, _message: &str, _details: Option<serde_json::Value>) {}
}
