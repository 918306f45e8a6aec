//! Maps raw progress records of any worker release onto [`ProgressEvent`].

use crate::classify::RawProgress;
use crate::model::{Eta, OutputFormat, ProgressEvent, ProgressStatus};
use serde_json::Value;

/// Accepted source keys per canonical field, most authoritative first.
///
/// File-level percentage wins over playlist-level when both are present.
pub mod aliases {
    pub const STATUS: &[&str] = &["status"];
    pub const PERCENTAGE_NUMERIC: &[&str] = &["file_percent", "percentage", "percent"];
    pub const PERCENTAGE_TEXT: &[&str] = &["_percent_str", "percent_str"];
    pub const PERCENTAGE_PLAYLIST: &[&str] = &["playlist_percent"];
    pub const DOWNLOADED_BYTES: &[&str] = &["downloaded_bytes", "downloaded"];
    pub const TOTAL_BYTES: &[&str] = &["total_bytes", "total", "total_bytes_estimate"];
    pub const SPEED_TEXT: &[&str] = &["_speed_str", "speed_str", "speed"];
    pub const SPEED_NUMERIC: &[&str] = &["speed", "speed_bytes"];
    pub const ETA: &[&str] = &["eta", "_eta_str", "eta_str"];
    pub const MESSAGE: &[&str] = &["message", "msg"];
    pub const FILE_NAME: &[&str] = &["filename", "currentFile", "current_file", "tmpfilename"];
    pub const PLAYLIST_FLAG: &[&str] = &["is_playlist", "isPlaylist"];
    pub const PLAYLIST_INDEX: &[&str] = &["playlist_index", "current_index", "item_index"];
    pub const PLAYLIST_COUNT: &[&str] = &["playlist_count", "total_items", "n_entries"];
    pub const PLAYLIST_NAME: &[&str] = &["playlist_name", "playlist_title", "playlist"];
}

/// Suffixes the worker writes while a file is still in flight.
const TRANSIENT_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];

/// Download containers that get converted into the requested format.
const CONTAINER_EXTENSIONS: &[&str] = &[
    "webm", "mkv", "mp4", "m4a", "opus", "ogg", "weba", "3gp", "flv", "mov", "aac",
];

pub fn normalize_progress(raw: &RawProgress, format: OutputFormat) -> ProgressEvent {
    let downloaded_bytes = first_of(raw, aliases::DOWNLOADED_BYTES, coerce_bytes).unwrap_or(0);
    let total_bytes = first_of(raw, aliases::TOTAL_BYTES, coerce_bytes).unwrap_or(0);

    let mut percentage = resolve_percentage(raw)
        .or_else(|| {
            (total_bytes > 0).then(|| downloaded_bytes as f64 / total_bytes as f64 * 100.0)
        })
        .map(clamp_percentage)
        .unwrap_or(0.0);

    let reported = first_of(raw, aliases::STATUS, |v| {
        v.as_str().and_then(ProgressStatus::from_worker_str)
    });
    let status = reported.unwrap_or_else(|| infer_status(percentage));
    if status == ProgressStatus::Finished {
        percentage = 100.0;
    }

    let (speed_bytes_per_second, speed_text) = resolve_speed(raw);

    let eta_seconds = first_of(raw, aliases::ETA, coerce_eta)
        .map(Eta::Seconds)
        .unwrap_or(Eta::Unknown);

    let message = first_of(raw, aliases::MESSAGE, coerce_text).unwrap_or_default();
    let current_file_name = first_of(raw, aliases::FILE_NAME, coerce_text)
        .map(|name| normalize_file_name(&name, format))
        .unwrap_or_default();

    let flagged = first_of(raw, aliases::PLAYLIST_FLAG, Value::as_bool).unwrap_or(false);
    let count = first_of(raw, aliases::PLAYLIST_COUNT, coerce_count).unwrap_or(0);
    let is_playlist = flagged || count > 1;
    let (current_item_index, total_item_count) = if is_playlist {
        let index = first_of(raw, aliases::PLAYLIST_INDEX, coerce_count).unwrap_or(0);
        if count > 0 {
            (index.min(count), count)
        } else {
            (index, count)
        }
    } else {
        (0, 0)
    };
    let playlist_name = if is_playlist {
        first_of(raw, aliases::PLAYLIST_NAME, coerce_text).unwrap_or_default()
    } else {
        String::new()
    };

    ProgressEvent {
        status,
        percentage,
        downloaded_bytes,
        total_bytes,
        speed_bytes_per_second,
        speed_text,
        eta_seconds,
        message,
        current_file_name,
        is_playlist,
        current_item_index,
        total_item_count,
        playlist_name,
        timestamp_millis: 0,
    }
}

fn infer_status(percentage: f64) -> ProgressStatus {
    if percentage >= 100.0 {
        ProgressStatus::Finished
    } else {
        ProgressStatus::Downloading
    }
}

fn first_of<T>(raw: &RawProgress, keys: &[&str], coerce: impl Fn(&Value) -> Option<T>) -> Option<T> {
    keys.iter().filter_map(|k| raw.get(*k)).find_map(coerce)
}

// Each key is tried as a number and then as text before the next, less specific key.
fn resolve_percentage(raw: &RawProgress) -> Option<f64> {
    let either = |v: &Value| v.as_f64().or_else(|| v.as_str().and_then(parse_percent_text));
    first_of(raw, aliases::PERCENTAGE_NUMERIC, either)
        .or_else(|| first_of(raw, aliases::PERCENTAGE_TEXT, either))
        .or_else(|| first_of(raw, aliases::PERCENTAGE_PLAYLIST, either))
}

pub fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// `" 45.0%"` -> 45.0. Anything that is not a digit, `.` or `-` is dropped first.
pub fn parse_percent_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn coerce_bytes(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_f64().map(non_negative_u64),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(non_negative_u64)
                .or_else(|| parse_human_bytes(trimmed))
        }
        _ => None,
    }
}

fn coerce_count(value: &Value) -> Option<u32> {
    coerce_bytes(value).map(|n| n.min(u32::MAX as u64) as u32)
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn non_negative_u64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}

fn resolve_speed(raw: &RawProgress) -> (u64, String) {
    let from_text = first_of(raw, aliases::SPEED_TEXT, |v| {
        let text = v.as_str()?.trim();
        parse_human_bytes(text).map(|bps| (bps, text.to_string()))
    });
    if let Some(found) = from_text {
        return found;
    }
    match first_of(raw, aliases::SPEED_NUMERIC, |v| v.as_f64()) {
        Some(bps) => {
            let bps = non_negative_u64(bps);
            (bps, format_speed(bps))
        }
        None => (0, "0 B/s".to_string()),
    }
}

fn coerce_eta(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.floor() as u64),
        Value::String(s) => parse_clock(s),
        _ => None,
    }
}

/// `"SS"`, `"MM:SS"` or `"H:MM:SS"` to seconds.
pub fn parse_clock(text: &str) -> Option<u64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut total = 0_u64;
    for part in parts {
        let value: u64 = part.trim().parse().ok()?;
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}

/// `"3.20MiB"`, `"820KiB/s"`, `"~12.3 kB"` to a byte count.
pub fn parse_human_bytes(text: &str) -> Option<u64> {
    let text = text.trim().trim_start_matches('~').trim();
    let text = text.strip_suffix("/s").unwrap_or(text).trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let unit = unit.trim();
    let multiplier: f64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kib" => 1024.0,
        "kb" => 1000.0,
        "m" | "mib" => 1024.0 * 1024.0,
        "mb" => 1000.0 * 1000.0,
        "g" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "gb" => 1_000_000_000.0,
        "tib" => 1024.0_f64.powi(4),
        "tb" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

pub fn format_speed(bytes_per_second: u64) -> String {
    const UNITS: [&str; 4] = ["KiB/s", "MiB/s", "GiB/s", "TiB/s"];
    if bytes_per_second < 1024 {
        return format!("{bytes_per_second} B/s");
    }
    let mut value = bytes_per_second as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Display name of the file the job will end up producing.
pub fn normalize_file_name(raw: &str, format: OutputFormat) -> String {
    let mut name = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_string();

    while let Some((stem, ext)) = split_extension(&name) {
        if TRANSIENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            name = stem.to_string();
        } else {
            break;
        }
    }

    let Some((stem, ext)) = split_extension(&name) else {
        return name;
    };
    let ext_lower = ext.to_ascii_lowercase();
    let is_container = CONTAINER_EXTENSIONS.contains(&ext_lower.as_str());
    let target = format.extension();
    if !is_container && target != Some(ext_lower.as_str()) {
        return name;
    }

    let stem = strip_format_id(stem);
    match target {
        Some(target) => format!("{stem}.{target}"),
        None => format!("{stem}.{ext}"),
    }
}

fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains(' ') {
        return None;
    }
    Some((stem, ext))
}

// yt-dlp tags per-format downloads as `title.f251.webm`.
fn strip_format_id(stem: &str) -> &str {
    if let Some((head, tail)) = stem.rsplit_once('.') {
        let is_format_id = tail.len() > 1
            && tail.starts_with('f')
            && tail[1..].chars().all(|c| c.is_ascii_digit());
        if is_format_id && !head.is_empty() {
            return head;
        }
    }
    stem
}

/// Keeps the most recent delivered event and enforces per-item monotonic percentage.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, mut event: ProgressEvent) -> ProgressEvent {
        if let Some(prev) = &self.last {
            if same_item(prev, &event) {
                if event.percentage < prev.percentage {
                    event.percentage = prev.percentage;
                }
                if event.current_file_name.is_empty() {
                    event.current_file_name = prev.current_file_name.clone();
                }
                if !event.is_playlist && prev.is_playlist {
                    event.is_playlist = true;
                    event.current_item_index = prev.current_item_index;
                    event.total_item_count = prev.total_item_count;
                    event.playlist_name = prev.playlist_name.clone();
                }
                if event.total_bytes == 0 {
                    event.total_bytes = prev.total_bytes;
                }
            }
        }
        self.last = Some(event.clone());
        event
    }

    pub fn last(&self) -> Option<&ProgressEvent> {
        self.last.as_ref()
    }
}

fn same_item(prev: &ProgressEvent, next: &ProgressEvent) -> bool {
    let index_matches = next.current_item_index == 0 || next.current_item_index == prev.current_item_index;
    let name_matches = next.current_file_name.is_empty()
        || prev.current_file_name.is_empty()
        || next.current_file_name == prev.current_file_name;
    index_matches && name_matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawProgress {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn norm(value: Value) -> ProgressEvent {
        normalize_progress(&raw(value), OutputFormat::Mp3)
    }

    #[test]
    fn textual_percentage_in_numeric_field() {
        let ev = norm(json!({"status": "downloading", "percentage": "45.0%"}));
        assert_eq!(ev.status, ProgressStatus::Downloading);
        assert_eq!(ev.percentage, 45.0);
    }

    #[test]
    fn every_percentage_alias_gives_the_same_value() {
        let payloads = [
            json!({"file_percent": 37.5}),
            json!({"percentage": 37.5}),
            json!({"percent": 37.5}),
            json!({"_percent_str": " 37.5%"}),
            json!({"percent_str": "37.5 %"}),
            json!({"playlist_percent": 37.5}),
            json!({"percentage": "37.5"}),
        ];
        for payload in payloads {
            assert_eq!(norm(payload.clone()).percentage, 37.5, "{payload}");
        }
    }

    #[test]
    fn file_level_percentage_beats_playlist_level() {
        let ev = norm(json!({"file_percent": 80.0, "playlist_percent": 20.0, "percentage": 20.0}));
        assert_eq!(ev.percentage, 80.0);
    }

    #[test]
    fn file_level_text_beats_generic_number() {
        let ev = norm(json!({"file_percent": "80%", "percentage": 20}));
        assert_eq!(ev.percentage, 80.0);

        let ev = norm(json!({"file_percent": "n/a", "percentage": 20}));
        assert_eq!(ev.percentage, 20.0);
    }

    #[test]
    fn numeric_field_is_preferred_over_text_field() {
        let ev = norm(json!({"_percent_str": "10.0%", "percent": 12.0}));
        assert_eq!(ev.percentage, 12.0);
    }

    #[test]
    fn percentage_is_clamped_for_hostile_input() {
        let inputs = [
            json!(-5),
            json!(250.0),
            json!("-12%"),
            json!("999.9%"),
            json!("abc"),
            json!("1.2.3%"),
            json!(""),
            json!(null),
            json!(true),
            json!(1e300),
        ];
        for input in inputs {
            let ev = norm(json!({"percentage": input.clone()}));
            assert!(
                (0.0..=100.0).contains(&ev.percentage),
                "{input} -> {}",
                ev.percentage
            );
        }
        assert_eq!(norm(json!({"percentage": "-12%"})).percentage, 0.0);
        assert_eq!(norm(json!({"percentage": 250})).percentage, 100.0);
    }

    #[test]
    fn percentage_falls_back_to_byte_ratio() {
        let ev = norm(json!({"downloaded_bytes": 25, "total_bytes": 100}));
        assert_eq!(ev.percentage, 25.0);
        assert_eq!(ev.status, ProgressStatus::Downloading);
    }

    #[test]
    fn status_is_inferred_when_missing_or_engine_owned() {
        assert_eq!(norm(json!({"percentage": 100})).status, ProgressStatus::Finished);
        assert_eq!(norm(json!({"percentage": 0})).status, ProgressStatus::Downloading);
        assert_eq!(norm(json!({"status": "cancelled", "percentage": 5})).status, ProgressStatus::Downloading);
        assert_eq!(norm(json!({"status": "bogus", "percentage": 100})).status, ProgressStatus::Finished);
        let finished = norm(json!({"status": "finished", "percentage": 40}));
        assert_eq!(finished.status, ProgressStatus::Finished);
        assert_eq!(finished.percentage, 100.0);
    }

    #[test]
    fn byte_counts_accept_numbers_and_strings() {
        let ev = norm(json!({"downloaded": "2048", "total_bytes": null, "total_bytes_estimate": 4096.7}));
        assert_eq!(ev.downloaded_bytes, 2048);
        assert_eq!(ev.total_bytes, 4096);
        let neg = norm(json!({"downloaded_bytes": -10}));
        assert_eq!(neg.downloaded_bytes, 0);
        assert_eq!(neg.total_bytes, 0);
    }

    #[test]
    fn speed_prefers_text_then_numeric_then_default() {
        let text = norm(json!({"_speed_str": "1.50MiB/s", "speed": 10}));
        assert_eq!(text.speed_bytes_per_second, 1_572_864);
        assert_eq!(text.speed_text, "1.50MiB/s");

        let numeric = norm(json!({"_speed_str": "N/A", "speed": 2048.0}));
        assert_eq!(numeric.speed_bytes_per_second, 2048);
        assert_eq!(numeric.speed_text, "2.00 KiB/s");

        let old_string_speed = norm(json!({"speed": "820KiB/s"}));
        assert_eq!(old_string_speed.speed_bytes_per_second, 820 * 1024);

        let none = norm(json!({}));
        assert_eq!(none.speed_bytes_per_second, 0);
        assert_eq!(none.speed_text, "0 B/s");
    }

    #[test]
    fn eta_accepts_seconds_and_clock_text() {
        assert_eq!(norm(json!({"eta": 42})).eta_seconds, Eta::Seconds(42));
        assert_eq!(norm(json!({"_eta_str": "03:15"})).eta_seconds, Eta::Seconds(195));
        assert_eq!(norm(json!({"eta_str": "1:00:05"})).eta_seconds, Eta::Seconds(3605));
        assert_eq!(norm(json!({"eta": -1})).eta_seconds, Eta::Unknown);
        assert_eq!(norm(json!({"eta": "N/A", "_eta_str": "--:--"})).eta_seconds, Eta::Unknown);
        assert_eq!(norm(json!({"eta": "N/A", "_eta_str": "00:09"})).eta_seconds, Eta::Seconds(9));
        assert_eq!(norm(json!({})).eta_seconds.to_string(), "--:--");
    }

    #[test]
    fn file_name_shows_the_eventual_output() {
        assert_eq!(
            normalize_file_name("/tmp/out/Song Title.f251.webm.part", OutputFormat::Mp3),
            "Song Title.mp3"
        );
        assert_eq!(normalize_file_name(r"C:\Music\Track.m4a", OutputFormat::Flac), "Track.flac");
        assert_eq!(normalize_file_name("Track.mp3", OutputFormat::Mp3), "Track.mp3");
        assert_eq!(normalize_file_name("Track.webm.ytdl", OutputFormat::Best), "Track.webm");
        assert_eq!(normalize_file_name("cover.jpg", OutputFormat::Mp3), "cover.jpg");
        assert_eq!(normalize_file_name("Mr. Brightside.mp4", OutputFormat::Wav), "Mr. Brightside.wav");
        assert_eq!(normalize_file_name("no_extension", OutputFormat::Mp3), "no_extension");
    }

    #[test]
    fn playlist_fields_follow_count_and_flag() {
        let ev = norm(json!({"playlist_index": 2, "playlist_count": 5, "playlist_name": "Mix"}));
        assert!(ev.is_playlist);
        assert_eq!((ev.current_item_index, ev.total_item_count), (2, 5));
        assert_eq!(ev.playlist_name, "Mix");

        let single = norm(json!({"playlist_index": 1, "playlist_count": 1}));
        assert!(!single.is_playlist);
        assert_eq!((single.current_item_index, single.total_item_count), (0, 0));

        let flagged = norm(json!({"isPlaylist": true, "current_index": 3}));
        assert!(flagged.is_playlist);
        assert_eq!(flagged.current_item_index, 3);

        let overflow = norm(json!({"playlist_index": 9, "playlist_count": "4"}));
        assert!(overflow.current_item_index <= overflow.total_item_count);
    }

    #[test]
    fn human_bytes_cover_binary_and_decimal_units() {
        assert_eq!(parse_human_bytes("3.00MiB"), Some(3 * 1024 * 1024));
        assert_eq!(parse_human_bytes("~12 kB"), Some(12_000));
        assert_eq!(parse_human_bytes("512B/s"), Some(512));
        assert_eq!(parse_human_bytes("Unknown B/s"), None);
        assert_eq!(parse_human_bytes("N/A"), None);
    }

    #[test]
    fn clock_parsing_rejects_garbage() {
        assert_eq!(parse_clock("07"), Some(7));
        assert_eq!(parse_clock("1:2:3:4"), None);
        assert_eq!(parse_clock("--:--"), None);
        assert_eq!(parse_clock("Unknown"), None);
    }

    #[test]
    fn tracker_keeps_percentage_monotonic_within_an_item() {
        let mut tracker = ProgressTracker::new();
        let first = tracker.apply(norm(json!({"percentage": 45, "filename": "a.webm"})));
        assert_eq!(first.current_file_name, "a.mp3");

        let stale = tracker.apply(norm(json!({"percentage": 44})));
        assert_eq!(stale.percentage, 45.0);
        assert_eq!(stale.current_file_name, "a.mp3");

        let next_item = tracker.apply(norm(json!({"percentage": 3, "filename": "b.webm"})));
        assert_eq!(next_item.percentage, 3.0);
        assert_eq!(tracker.last().map(|e| e.current_file_name.as_str()), Some("b.mp3"));
    }
}
