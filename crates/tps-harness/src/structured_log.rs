//! Structured JSONL logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes records to a file, stdout, or an in-memory buffer.
//! - [`validate_log_line`]: checks a single line against the schema.
//! - [`validate_log_file`]: checks an entire JSONL file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tps_core::TpsError;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Result of one step or one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Scenario-local thread label (e.g. `owner`, `reader-2`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Domain operation (`create`, `read`, `clone`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    /// Share count of the thread's page after the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            scenario: None,
            thread: None,
            op: None,
            outcome: None,
            error: None,
            errno: None,
            share_count: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    #[must_use]
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Record a domain error and its errno.
    #[must_use]
    pub fn with_tps_error(mut self, err: &TpsError) -> Self {
        self.error = Some(err.to_string());
        self.errno = Some(err.errno());
        self
    }

    /// Record a free-form error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_share_count(mut self, share_count: u32) -> Self {
        self.share_count = Some(share_count);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

enum Sink {
    File(BufWriter<File>),
    Stdout(std::io::Stdout),
    Buffer(Vec<u8>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::File(w) => w,
            Self::Stdout(w) => w,
            Self::Buffer(w) => w,
        }
    }
}

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    sink: Sink,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::with_sink(Sink::File(BufWriter::new(file)), run_id))
    }

    #[must_use]
    pub fn to_stdout(run_id: &str) -> Self {
        Self::with_sink(Sink::Stdout(std::io::stdout()), run_id)
    }

    /// Create an emitter that writes to memory (for testing).
    #[must_use]
    pub fn to_buffer(run_id: &str) -> Self {
        Self::with_sink(Sink::Buffer(Vec::new()), run_id)
    }

    fn with_sink(sink: Sink, run_id: &str) -> Self {
        Self {
            sink,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    /// Generate the next trace ID.
    pub fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("tps::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare log entry with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event);
        self.write_line(&entry)?;
        Ok(entry)
    }

    /// Emit a populated log entry, filling in the trace id if empty.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        self.write_line(&entry)
    }

    fn write_line(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        writeln!(self.sink.writer(), "{line}")
    }

    /// Lines written so far, when writing to a buffer.
    #[must_use]
    pub fn buffered_lines(&self) -> Vec<String> {
        match &self.sink {
            Sink::Buffer(buf) => String::from_utf8_lossy(buf)
                .lines()
                .map(str::to_string)
                .collect(),
            Sink::File(_) | Sink::Stdout(_) => Vec::new(),
        }
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.sink.writer().flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            fail("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        fail("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            fail(field, "required field missing".to_string());
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !["trace", "debug", "info", "warn", "error", "fatal"].contains(&level)
    {
        fail("level", format!("invalid level: '{level}'"));
    }

    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str())
        && !["pass", "fail", "skip", "error"].contains(&outcome)
    {
        fail("outcome", format!("invalid outcome: '{outcome}'"));
    }

    if let Some(op) = obj.get("op").and_then(|v| v.as_str())
        && !["init", "create", "destroy", "read", "write", "clone"].contains(&op)
    {
        fail("op", format!("invalid op: '{op}'"));
    }

    // An errno only makes sense next to the error it came from.
    if obj.contains_key("errno") && !obj.get("error").is_some_and(serde_json::Value::is_string) {
        fail("error", "errno present without error message".to_string());
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        fail(
            "trace_id",
            format!("trace_id should follow tps::<run_id>::<seq> format, got: '{trace_id}'"),
        );
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the total line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("tps::run-1::001", LogLevel::Info, "scenario_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "tps::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "scenario_start");
        assert!(parsed.get("scenario").is_none());
        assert!(parsed.get("errno").is_none());
    }

    #[test]
    fn log_entry_with_all_optional_fields() {
        let err = TpsError::NoBinding(tps_core::Tid(7));
        let entry = LogEntry::new("tps::run-1::002", LogLevel::Error, "tps_op")
            .with_scenario("error-cases")
            .with_thread("main")
            .with_op("destroy")
            .with_outcome(Outcome::Pass)
            .with_tps_error(&err)
            .with_share_count(2)
            .with_details(serde_json::json!({"expected": "NoBinding"}));

        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["scenario"], "error-cases");
        assert_eq!(parsed["thread"], "main");
        assert_eq!(parsed["op"], "destroy");
        assert_eq!(parsed["outcome"], "pass");
        assert_eq!(parsed["errno"], libc::ENOENT);
        assert!(parsed["error"].as_str().unwrap().contains("no private storage"));
        assert_eq!(parsed["share_count"], 2);
        assert!(parsed["details"].is_object());
        assert!(validate_log_line(&json, 1).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_rejects_unknown_vocabulary() {
        let json = r#"{"timestamp":"t","trace_id":"a::b::c","level":"critical","event":"e","op":"mmap","outcome":"maybe"}"#;
        let errors = validate_log_line(json, 3).unwrap_err();
        for field in ["level", "op", "outcome"] {
            assert!(errors.iter().any(|e| e.field == field), "{field}");
        }
        assert!(errors.iter().all(|e| e.line_number == 3));
    }

    #[test]
    fn validate_errno_needs_error() {
        let json = r#"{"timestamp":"t","trace_id":"a::b::c","level":"info","event":"e","errno":2}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "error"));
    }

    #[test]
    fn validate_invalid_json_and_trace_id() {
        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "<json>"));

        let json = r#"{"timestamp":"t","trace_id":"no-separator","level":"info","event":"e"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let mut emitter = LogEmitter::to_buffer("run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap();
        assert_eq!(e1.trace_id, "tps::run-42::001");
        assert_eq!(e2.trace_id, "tps::run-42::002");

        let lines = emitter.buffered_lines();
        assert_eq!(lines.len(), 2);
        for (i, line) in lines.iter().enumerate() {
            assert!(validate_log_line(line, i + 1).is_ok(), "{line}");
        }
    }

    #[test]
    fn timestamps_use_calendar_dates() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2000-02-29 is a leap day.
        assert_eq!(format_utc(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(format_utc(1_790_000_000, 0), "2026-09-21T14:13:20.000Z");
    }
}
