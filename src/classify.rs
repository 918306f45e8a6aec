//! Decides what a single worker output line is: a structured payload, a legacy
//! text progress marker, or plain diagnostics.

use crate::lines::Channel;
use crate::progress::{aliases, parse_human_bytes};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Raw key/value progress record, in whatever field vocabulary the worker used.
pub type RawProgress = Map<String, Value>;

/// `[PROGRESS] downloading - 62.5%`, printed by the worker's console reporter.
pub const LEGACY_STATUS_MARKER_V1: &str =
    r"^\[(?P<tag>[A-Za-z_]+)\]\s+(?P<status>[A-Za-z_]+)\s+-\s+(?P<pct>-?\d+(?:\.\d+)?)\s*%";

/// yt-dlp style notice: `[download]  45.0% of ~3.20MiB at 1.20MiB/s ETA 00:03`.
pub const LEGACY_DOWNLOAD_NOTICE_V1: &str = r"(?P<pct>\d+(?:\.\d+)?)%\s+of\b\s*~?\s*(?P<total>\d+(?:\.\d+)?\s*[KMGTPE]?i?B)?(?:.*?\bat\s+(?P<speed>\S+))?(?:.*?\bETA\s+(?P<eta>\S+))?";

const LEGACY_ERROR_MARKER: &str = r"^(?:\[ERROR\]\s*|ERROR:\s*)(?P<msg>.*)$";

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerPayload {
    Progress(RawProgress),
    Result(RawResult),
    Error(String),
    /// A `type` this engine does not know; ignored.
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Payload(WorkerPayload),
    Diagnostic { level: DiagnosticLevel, text: String },
    /// Looked structured but could not be used.
    Malformed(String),
    Blank,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult {
    pub success: bool,
    pub message: Option<String>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

impl RawResult {
    fn from_object(map: &Map<String, Value>) -> Self {
        let success = match map.get("success") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        };
        Self {
            success,
            message: non_empty_str(map.get("message")),
            output_path: non_empty_str(map.get("output_path")),
            error: non_empty_str(map.get("error")),
        }
    }

    /// Most specific failure text the worker gave, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub fn classify_line(channel: Channel, line: &str) -> Classified {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Classified::Blank;
    }

    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return classify_object(map);
        }
    }

    if channel == Channel::Stderr {
        if let Some(raw) = match_legacy_progress(trimmed) {
            return Classified::Payload(WorkerPayload::Progress(raw));
        }
    }

    let level = match error_marker_re().captures(trimmed) {
        Some(_) => DiagnosticLevel::Error,
        None => DiagnosticLevel::Info,
    };
    Classified::Diagnostic {
        level,
        text: trimmed.to_string(),
    }
}

/// Text after an `[ERROR]` / `ERROR:` prefix.
pub fn error_marker_text(line: &str) -> Option<String> {
    let caps = error_marker_re().captures(line.trim())?;
    let msg = caps.name("msg")?.as_str().trim();
    if msg.is_empty() {
        None
    } else {
        Some(msg.to_string())
    }
}

fn classify_object(mut map: Map<String, Value>) -> Classified {
    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(other) => return Classified::Malformed(format!("payload type is not a string: {other}")),
        None => return classify_untyped(map),
    };

    match kind.as_str() {
        "progress" => match map.remove("data") {
            Some(Value::Object(data)) => Classified::Payload(WorkerPayload::Progress(data)),
            _ => Classified::Malformed("progress payload without a data object".to_string()),
        },
        "result" => {
            let result = match map.get("data") {
                Some(Value::Object(data)) => RawResult::from_object(data),
                _ => RawResult::from_object(&map),
            };
            Classified::Payload(WorkerPayload::Result(result))
        }
        "error" => {
            let data = map.get("data");
            let message = data
                .and_then(Value::as_object)
                .and_then(|d| non_empty_str(d.get("message")).or_else(|| non_empty_str(d.get("error"))))
                .or_else(|| non_empty_str(data))
                .or_else(|| non_empty_str(map.get("message")))
                .or_else(|| non_empty_str(map.get("error")))
                .unwrap_or_else(|| "worker reported an error".to_string());
            Classified::Payload(WorkerPayload::Error(message))
        }
        _ => Classified::Payload(WorkerPayload::Unknown(kind)),
    }
}

// Workers that predate the `type` envelope printed bare progress and result objects.
fn classify_untyped(map: Map<String, Value>) -> Classified {
    if matches!(map.get("success"), Some(Value::Bool(_))) {
        return Classified::Payload(WorkerPayload::Result(RawResult::from_object(&map)));
    }
    let looks_like_progress = map.contains_key("status")
        || aliases::PERCENTAGE_NUMERIC
            .iter()
            .chain(aliases::PERCENTAGE_TEXT)
            .any(|k| map.contains_key(*k));
    if looks_like_progress {
        return Classified::Payload(WorkerPayload::Progress(map));
    }
    Classified::Diagnostic {
        level: DiagnosticLevel::Info,
        text: Value::Object(map).to_string(),
    }
}

fn match_legacy_progress(line: &str) -> Option<RawProgress> {
    if let Some(caps) = status_marker_re().captures(line) {
        let pct: f64 = caps.name("pct")?.as_str().parse().ok()?;
        let mut raw = RawProgress::new();
        raw.insert("status".to_string(), Value::from(caps.name("status")?.as_str().to_ascii_lowercase()));
        raw.insert("percentage".to_string(), Value::from(pct));
        return Some(raw);
    }

    let caps = download_notice_re().captures(line)?;
    let pct: f64 = caps.name("pct")?.as_str().parse().ok()?;
    let mut raw = RawProgress::new();
    raw.insert("status".to_string(), Value::from("downloading"));
    raw.insert("percentage".to_string(), Value::from(pct));
    if let Some(total) = caps.name("total").and_then(|m| parse_human_bytes(m.as_str())) {
        raw.insert("total_bytes".to_string(), Value::from(total));
    }
    if let Some(speed) = caps.name("speed") {
        raw.insert("_speed_str".to_string(), Value::from(speed.as_str()));
    }
    if let Some(eta) = caps.name("eta") {
        raw.insert("_eta_str".to_string(), Value::from(eta.as_str()));
    }
    Some(raw)
}

fn status_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LEGACY_STATUS_MARKER_V1).expect("legacy status marker pattern"))
}

fn download_notice_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LEGACY_DOWNLOAD_NOTICE_V1).expect("legacy download notice pattern"))
}

fn error_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LEGACY_ERROR_MARKER).expect("error marker pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_of(classified: Classified) -> RawProgress {
        match classified {
            Classified::Payload(WorkerPayload::Progress(raw)) => raw,
            other => panic!("expected progress payload, got {other:?}"),
        }
    }

    #[test]
    fn typed_progress_payload_yields_data_object() {
        let raw = progress_of(classify_line(
            Channel::Stdout,
            r#"  {"type":"progress","data":{"status":"downloading","percentage":"45.0%"}}"#,
        ));
        assert_eq!(raw.get("status"), Some(&Value::from("downloading")));
        assert_eq!(raw.get("percentage"), Some(&Value::from("45.0%")));
    }

    #[test]
    fn result_payload_reads_all_fields() {
        let got = classify_line(
            Channel::Stdout,
            r#"{"type":"result","data":{"success":true,"message":null,"output_path":"/out/x.mp3","error":null}}"#,
        );
        assert_eq!(
            got,
            Classified::Payload(WorkerPayload::Result(RawResult {
                success: true,
                message: None,
                output_path: Some("/out/x.mp3".to_string()),
                error: None,
            }))
        );
    }

    #[test]
    fn error_payload_accepts_top_level_message() {
        let got = classify_line(
            Channel::Stderr,
            r#"{"type": "error", "message": "Error formatting progress: bad"}"#,
        );
        assert_eq!(
            got,
            Classified::Payload(WorkerPayload::Error("Error formatting progress: bad".to_string()))
        );
    }

    #[test]
    fn unknown_type_is_forward_compatible() {
        let got = classify_line(Channel::Stdout, r#"{"type":"thumbnail","data":{}}"#);
        assert_eq!(got, Classified::Payload(WorkerPayload::Unknown("thumbnail".to_string())));
    }

    #[test]
    fn broken_json_falls_through_to_diagnostic() {
        let got = classify_line(Channel::Stdout, r#"{"type":"progress","data":{"percen"#);
        assert!(matches!(got, Classified::Diagnostic { level: DiagnosticLevel::Info, .. }));
    }

    #[test]
    fn progress_without_data_is_malformed() {
        let got = classify_line(Channel::Stdout, r#"{"type":"progress"}"#);
        assert!(matches!(got, Classified::Malformed(_)));
    }

    #[test]
    fn untyped_legacy_objects_are_recognized() {
        let raw = progress_of(classify_line(
            Channel::Stdout,
            r#"{"percentage": 12.5, "downloaded": 10, "total": 80, "speed": "1.2MiB/s", "eta": 5, "status": "downloading"}"#,
        ));
        assert_eq!(raw.get("downloaded"), Some(&Value::from(10)));

        let got = classify_line(Channel::Stdout, r#"{"success": false, "error": "no results"}"#);
        match got {
            Classified::Payload(WorkerPayload::Result(r)) => {
                assert!(!r.success);
                assert_eq!(r.failure_message(), Some("no results"));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn legacy_status_marker_on_stderr() {
        let raw = progress_of(classify_line(Channel::Stderr, "[PROGRESS] downloading - 62.5%"));
        assert_eq!(raw.get("status"), Some(&Value::from("downloading")));
        assert_eq!(raw.get("percentage").and_then(Value::as_f64), Some(62.5));
    }

    #[test]
    fn legacy_markers_on_stdout_stay_diagnostic() {
        let got = classify_line(Channel::Stdout, "[PROGRESS] downloading - 62.5%");
        assert!(matches!(got, Classified::Diagnostic { .. }));
    }

    #[test]
    fn legacy_download_notice_extracts_optional_tokens() {
        let raw = progress_of(classify_line(
            Channel::Stderr,
            "[download]  45.0% of ~3.00MiB at 1.50MiB/s ETA 00:03",
        ));
        assert_eq!(raw.get("percentage").and_then(Value::as_f64), Some(45.0));
        assert_eq!(raw.get("total_bytes").and_then(Value::as_u64), Some(3 * 1024 * 1024));
        assert_eq!(raw.get("_speed_str"), Some(&Value::from("1.50MiB/s")));
        assert_eq!(raw.get("_eta_str"), Some(&Value::from("00:03")));

        let bare = progress_of(classify_line(Channel::Stderr, "7% of"));
        assert_eq!(bare.get("percentage").and_then(Value::as_f64), Some(7.0));
        assert!(bare.get("_speed_str").is_none());
    }

    #[test]
    fn error_markers_are_flagged() {
        let got = classify_line(Channel::Stderr, "ERROR: [youtube] abc: Video unavailable");
        assert!(matches!(got, Classified::Diagnostic { level: DiagnosticLevel::Error, .. }));
        assert_eq!(
            error_marker_text("[ERROR] Unknown error").as_deref(),
            Some("Unknown error")
        );
        assert_eq!(error_marker_text("[INFO] fine"), None);
    }

    #[test]
    fn blank_lines_are_blank() {
        assert_eq!(classify_line(Channel::Stdout, "   \t"), Classified::Blank);
    }
}
