//! Session Parser (L1, spec §4.1).
//!
//! Reads a newline-delimited record file into an ordered sequence of
//! [`Message`]s, pushing all payload-shape dispatch (string content vs.
//! list-of-blocks vs. alternate field names) into this module so nothing
//! downstream ever branches on shape (spec §9 "Dynamic message payloads").

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Result, SmartForkError};
use crate::types::Message;

/// Parsing strictness (spec §4.1 "Modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Any malformed record raises a fatal failure.
    Strict,
    /// Malformed records are skipped and counted. Default; the indexer
    /// always uses this mode.
    Lenient,
}

/// File-level metadata captured alongside the parsed messages.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub modified: SystemTime,
    pub created: SystemTime,
    pub path: PathBuf,
}

/// Counters accumulated while parsing one file.
#[derive(Debug, Clone, Default)]
pub struct ParseCounters {
    pub total_messages: usize,
    pub parse_errors: usize,
    pub skipped_lines: usize,
}

/// The result of parsing one session file (spec §4.1 "Contract").
#[derive(Debug, Clone)]
pub struct ParsedSession {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub file_metadata: FileMetadata,
    pub counters: ParseCounters,
}

/// Parse a newline-delimited session log at `path`.
///
/// Fails with [`SmartForkError::NotFound`] if `path` does not exist; in
/// [`ParseMode::Strict`] mode, fails with [`SmartForkError::InvalidInput`]
/// carrying the offending line number on the first malformed record.
pub fn parse(path: &Path, mode: ParseMode) -> Result<ParsedSession> {
    let metadata = fs::metadata(path).map_err(|_| {
        SmartForkError::NotFound(format!("session file not found: {}", path.display()))
    })?;

    let file_metadata = FileMetadata {
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        created: metadata.created().unwrap_or(SystemTime::UNIX_EPOCH),
        path: path.to_path_buf(),
    };

    let session_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let text = fs::read_to_string(path)?;

    let mut messages = Vec::new();
    let mut counters = ParseCounters::default();

    for (line_number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match parse_record(line) {
            Ok(message) => {
                counters.total_messages += 1;
                messages.push(message);
            }
            Err(err) => {
                if mode == ParseMode::Strict {
                    return Err(SmartForkError::InvalidInput(format!(
                        "malformed record at line {}: {}",
                        line_number + 1,
                        err
                    )));
                }
                tracing::warn!(
                    path = %path.display(),
                    line = line_number + 1,
                    error = %err,
                    "skipping malformed session record"
                );
                counters.parse_errors += 1;
                counters.skipped_lines += 1;
            }
        }
    }

    Ok(ParsedSession {
        session_id,
        messages,
        file_metadata,
        counters,
    })
}

/// Parse one self-describing JSON record line into a [`Message`].
fn parse_record(line: &str) -> std::result::Result<Message, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let object = value.as_object().ok_or("record is not a JSON object")?;

    let role = object
        .get("role")
        .or_else(|| object.get("type"))
        .and_then(Value::as_str)
        .ok_or("missing role/type field")?
        .to_string();

    if role.is_empty() {
        return Err("role must be non-empty".to_string());
    }

    let content = extract_content(object)?;

    let timestamp = object
        .get("timestamp")
        .and_then(parse_timestamp)
        .or_else(|| object.get("ts").and_then(parse_timestamp));

    let mut attributes = std::collections::HashMap::new();
    for (key, val) in object {
        if matches!(
            key.as_str(),
            "role" | "type" | "content" | "text" | "message" | "timestamp" | "ts"
        ) {
            continue;
        }
        attributes.insert(key.clone(), val.clone());
    }

    Ok(Message {
        role,
        content,
        timestamp,
        attributes,
    })
}

/// Materialise `content` (string, or fallback `text`/`message`) into a
/// single string, flattening content-block lists by concatenating each
/// block's `text` field with newline separators.
fn extract_content(object: &serde_json::Map<String, Value>) -> std::result::Result<String, String> {
    let raw = object
        .get("content")
        .or_else(|| object.get("text"))
        .or_else(|| object.get("message"))
        .ok_or("missing content/text/message field")?;

    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .map(|s| s.to_string())
                .collect();
            Ok(parts.join("\n"))
        }
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// Parse a timestamp field: either an absolute ISO 8601 textual form or
/// an integer seconds-since-epoch.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok();
    }
    if let Some(secs) = value.as_i64() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parses_simple_records() {
        let file = write_temp(
            "{\"role\": \"user\", \"content\": \"hello\"}\n{\"role\": \"assistant\", \"content\": \"hi there\"}\n",
        );
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].role, "user");
        assert_eq!(parsed.messages[1].content, "hi there");
        assert_eq!(parsed.counters.parse_errors, 0);
    }

    #[test]
    fn test_lenient_skips_malformed() {
        let file = write_temp(
            "{\"role\": \"user\", \"content\": \"ok\"}\nnot json\n{\"content\": \"no role\"}\n",
        );
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.counters.parse_errors, 2);
        assert_eq!(parsed.counters.skipped_lines, 2);
    }

    #[test]
    fn test_strict_fails_on_first_malformed() {
        let file = write_temp("{\"role\": \"user\", \"content\": \"ok\"}\nnot json\n");
        let result = parse(file.path(), ParseMode::Strict);
        assert!(result.is_err());
    }

    #[test]
    fn test_content_block_list_flattened() {
        let file = write_temp(
            "{\"role\": \"assistant\", \"content\": [{\"type\": \"text\", \"text\": \"a\"}, {\"type\": \"text\", \"text\": \"b\"}]}\n",
        );
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(parsed.messages[0].content, "a\nb");
    }

    #[test]
    fn test_fallback_type_and_text_fields() {
        let file = write_temp("{\"type\": \"user\", \"text\": \"fallback content\"}\n");
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(parsed.messages[0].role, "user");
        assert_eq!(parsed.messages[0].content, "fallback content");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let result = parse(Path::new("/nonexistent/session.jsonl"), ParseMode::Lenient);
        assert!(matches!(result, Err(SmartForkError::NotFound(_))));
    }

    #[test]
    fn test_empty_file_yields_zero_messages() {
        let file = write_temp("");
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(parsed.messages.len(), 0);
    }

    #[test]
    fn test_integer_timestamp_parsed() {
        let file = write_temp("{\"role\": \"user\", \"content\": \"hi\", \"timestamp\": 1700000000}\n");
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert!(parsed.messages[0].timestamp.is_some());
    }

    #[test]
    fn test_extra_fields_preserved_as_attributes() {
        let file = write_temp("{\"role\": \"user\", \"content\": \"hi\", \"custom_field\": 42}\n");
        let parsed = parse(file.path(), ParseMode::Lenient).unwrap();
        assert_eq!(
            parsed.messages[0].attributes.get("custom_field"),
            Some(&Value::from(42))
        );
    }
}
