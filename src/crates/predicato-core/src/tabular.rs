//! Tolerant tabular response decoding.
//!
//! Extraction prompts ask the model for a table - TSV with a header of
//! field tags, or a YAML list of objects keyed by those tags. Models get
//! this subtly wrong often enough that decoding is presented as a
//! *conversation*, not a one-shot parse: when a reply fails to decode,
//! [`request_rows`] feeds the raw reply plus the parse error back into
//! the next chat turn and retries, up to a per-call-site cap. Consumers
//! never hand-roll tolerant parsing themselves.
//!
//! Decoding tolerances:
//! - fenced code blocks are unwrapped (with or without a language tag)
//! - empty lines are ignored
//! - TSV fields may be double-quoted; embedded tabs must be quoted and
//!   `""` escapes a quote
//! - `null` and the empty string both read as a missing optional field
//! - a YAML reply that wraps its list in a single-key mapping is unwrapped
//!
//! Rows pass through `serde_json::Value`, so numbers, booleans, and
//! strings all land in caller structs without per-site conversion.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::nlp::{NlpClient, NlpMessage};

/// Default number of chat turns a call site may spend on re-prompting.
pub const DEFAULT_PARSE_ATTEMPTS: usize = 3;

/// Response table encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    /// Tab-separated values, first line is the header.
    Tsv,
    /// A YAML list of objects.
    Yaml,
}

impl std::fmt::Display for TabularFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabularFormat::Tsv => f.write_str("TSV"),
            TabularFormat::Yaml => f.write_str("YAML"),
        }
    }
}

impl TabularFormat {
    /// Prompt fragment describing the expected reply shape for `fields`,
    /// given as `(tag, description)` pairs.
    pub fn instructions(&self, fields: &[(&str, &str)]) -> String {
        let mut out = String::new();
        match self {
            TabularFormat::Tsv => {
                out.push_str("Respond with a TSV table only. The first line must be this header:\n");
                let tags: Vec<&str> = fields.iter().map(|(tag, _)| *tag).collect();
                out.push_str(&tags.join("\t"));
                out.push_str("\nOne row per item. Use null for unknown optional values. ");
                out.push_str("Double-quote any field containing a tab.\n");
            }
            TabularFormat::Yaml => {
                out.push_str("Respond with a YAML list only. Each item is a mapping with keys:\n");
                for (tag, _) in fields {
                    out.push_str("  ");
                    out.push_str(tag);
                    out.push('\n');
                }
                out.push_str("Use null for unknown optional values.\n");
            }
        }
        out.push_str("Fields:\n");
        for (tag, description) in fields {
            out.push_str(&format!("  {tag}: {description}\n"));
        }
        out
    }
}

/// A decode failure, fed back into the conversation verbatim.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Decode `raw` as a table of `T` rows.
///
/// `expected_tags` are the field tags the caller asked for; a TSV header
/// mentioning none of them is rejected rather than read as an empty
/// table, which is what turns a prose reply into a re-prompt instead of
/// a silent empty result.
pub fn parse_rows<T: DeserializeOwned>(
    format: TabularFormat,
    raw: &str,
    expected_tags: &[&str],
) -> std::result::Result<Vec<T>, ParseError> {
    let objects = match format {
        TabularFormat::Tsv => parse_tsv(raw, expected_tags)?,
        TabularFormat::Yaml => parse_yaml(raw)?,
    };
    objects
        .into_iter()
        .enumerate()
        .map(|(index, object)| {
            serde_json::from_value(Value::Object(object))
                .map_err(|err| ParseError(format!("row {index}: {err}")))
        })
        .collect()
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line and the closing fence.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
}

fn parse_tsv(
    raw: &str,
    expected_tags: &[&str],
) -> std::result::Result<Vec<Map<String, Value>>, ParseError> {
    let body = strip_fences(raw);
    let mut lines = body.lines().map(str::trim_end).filter(|l| !l.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = split_tsv_line(header_line)?
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .collect();
    if header.iter().all(|tag| tag.is_empty()) {
        return Err(ParseError("header line has no field tags".to_string()));
    }
    if !expected_tags.is_empty()
        && !header
            .iter()
            .any(|tag| expected_tags.contains(&tag.as_str()))
    {
        return Err(ParseError(format!(
            "header {header:?} does not contain any of the expected tags {expected_tags:?}"
        )));
    }

    let mut rows = Vec::new();
    for line in lines {
        let fields = split_tsv_line(line)?;
        let mut object = Map::new();
        for (tag, field) in header.iter().zip(fields) {
            if let Some(value) = cell_value(&field) {
                object.insert(tag.clone(), value);
            }
        }
        if !object.is_empty() {
            rows.push(object);
        }
    }
    Ok(rows)
}

/// Split one TSV line, honoring double-quoted fields with `""` escapes.
fn split_tsv_line(line: &str) -> std::result::Result<Vec<String>, ParseError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;
    let mut field_started = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if !field_started && !in_quotes => {
                in_quotes = true;
                field_started = true;
            }
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '\t' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
                field_started = false;
            }
            other => {
                field_started = true;
                current.push(other);
            }
        }
    }
    if in_quotes {
        return Err(ParseError(format!("unterminated quote in line: {line:?}")));
    }
    fields.push(current);
    Ok(fields)
}

/// Interpret one cell; `None` means the field is missing.
fn cell_value(field: &str) -> Option<Value> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        return Some(Value::from(float));
    }
    match trimmed {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => Some(Value::String(trimmed.to_string())),
    }
}

fn parse_yaml(raw: &str) -> std::result::Result<Vec<Map<String, Value>>, ParseError> {
    let body = strip_fences(raw);
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(body).map_err(|err| ParseError(format!("not valid YAML: {err}")))?;
    let json: Value = serde_json::to_value(&parsed)
        .map_err(|err| ParseError(format!("YAML not representable as JSON: {err}")))?;

    let list = match json {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        // A single-key mapping wrapping the list is unwrapped.
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((_, Value::Array(items))) => items,
            Some((key, other)) => {
                return Err(ParseError(format!(
                    "expected a list under {key:?}, got {other}"
                )))
            }
            None => return Ok(Vec::new()),
        },
        other => return Err(ParseError(format!("expected a YAML list, got {other}"))),
    };

    list.into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(object) => Ok(object
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect()),
            other => Err(ParseError(format!("item {index} is not a mapping: {other}"))),
        })
        .collect()
}

/// Read an index list from a row cell that may be a number, a
/// comma-separated string, or a YAML/JSON array.
pub fn index_list(value: Option<&Value>) -> Vec<i64> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Number(n)) => n.as_i64().into_iter().collect(),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(Value::String(s)) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect(),
        Some(_) => Vec::new(),
    }
}

/// Drive an NLP exchange until the reply decodes as a table of `T`.
///
/// On a decode failure the assistant's raw reply and a parse-error turn
/// are appended to the conversation and the call retries, up to
/// `max_attempts` turns. The terminal failure is
/// [`CoreError::BadResponse`] carrying the last raw reply and the full
/// transcript.
pub async fn request_rows<T: DeserializeOwned>(
    nlp: &dyn NlpClient,
    messages: Vec<NlpMessage>,
    format: TabularFormat,
    expected_tags: &[&str],
    max_attempts: usize,
) -> Result<Vec<T>> {
    let mut transcript = messages;
    let mut last_raw = String::new();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts.max(1) {
        let response = nlp.chat(&transcript).await?;
        match parse_rows::<T>(format, &response.content, expected_tags) {
            Ok(rows) => return Ok(rows),
            Err(err) => {
                debug!(attempt, error = %err, "tabular decode failed, re-prompting");
                transcript.push(NlpMessage::assistant(&response.content));
                transcript.push(NlpMessage::user(format!(
                    "That reply could not be parsed as {format}: {err}. \
                     Reply again with only the requested {format} table and nothing else."
                )));
                last_raw = response.content;
                last_error = err.to_string();
            }
        }
    }

    Err(CoreError::BadResponse {
        message: format!("gave up decoding {format} response: {last_error}"),
        raw: last_raw,
        transcript,
    })
}

/// Like [`request_rows`] but expects at most one row.
pub async fn request_row<T: DeserializeOwned>(
    nlp: &dyn NlpClient,
    messages: Vec<NlpMessage>,
    format: TabularFormat,
    expected_tags: &[&str],
    max_attempts: usize,
) -> Result<Option<T>> {
    let mut rows = request_rows(nlp, messages, format, expected_tags, max_attempts).await?;
    if rows.is_empty() {
        Ok(None)
    } else {
        Ok(Some(rows.remove(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlpErrorKind;
    use crate::nlp::NlpResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        name: String,
        #[serde(default)]
        entity_type_id: Option<i64>,
        #[serde(default)]
        summary: Option<String>,
    }

    const TAGS: &[&str] = &["name", "entity_type_id", "summary"];

    #[test]
    fn test_tsv_basic() {
        let raw = "name\tentity_type_id\tsummary\nAlice\t1\tAn engineer\nAcme\t2\tnull\n";
        let rows: Vec<Row> = parse_rows(TabularFormat::Tsv, raw, TAGS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Alice");
        assert_eq!(rows[0].entity_type_id, Some(1));
        assert_eq!(rows[1].summary, None);
    }

    #[test]
    fn test_tsv_quoted_fields_with_tabs() {
        let raw = "name\tsummary\n\"Acme\tCorp\"\t\"Makes \"\"everything\"\"\"\n";
        let rows: Vec<Row> = parse_rows(TabularFormat::Tsv, raw, TAGS).unwrap();
        assert_eq!(rows[0].name, "Acme\tCorp");
        assert_eq!(rows[0].summary.as_deref(), Some("Makes \"everything\""));
    }

    #[test]
    fn test_tsv_skips_blank_lines_and_fences() {
        let raw = "```tsv\nname\n\nAlice\n\nBob\n```";
        let rows: Vec<Row> = parse_rows(TabularFormat::Tsv, raw, TAGS).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_tsv_header_only_is_empty() {
        let rows: Vec<Row> = parse_rows(TabularFormat::Tsv, "name\tsummary\n", TAGS).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_tsv_prose_reply_is_rejected() {
        let raw = "I think the entities are Alice and Acme.";
        assert!(parse_rows::<Row>(TabularFormat::Tsv, raw, TAGS).is_err());
    }

    #[test]
    fn test_tsv_unterminated_quote_fails() {
        let raw = "name\n\"Alice\n";
        assert!(parse_rows::<Row>(TabularFormat::Tsv, raw, TAGS).is_err());
    }

    #[test]
    fn test_yaml_list() {
        let raw = "- name: Alice\n  entity_type_id: 1\n- name: Acme\n  summary: null\n";
        let rows: Vec<Row> = parse_rows(TabularFormat::Yaml, raw, TAGS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].name, "Acme");
        assert_eq!(rows[1].summary, None);
    }

    #[test]
    fn test_yaml_single_key_wrapper_is_unwrapped() {
        let raw = "entities:\n  - name: Alice\n";
        let rows: Vec<Row> = parse_rows(TabularFormat::Yaml, raw, TAGS).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Alice");
    }

    #[test]
    fn test_index_list_variants() {
        assert_eq!(index_list(None), Vec::<i64>::new());
        assert_eq!(index_list(Some(&Value::from(3))), vec![3]);
        assert_eq!(index_list(Some(&Value::from("1, 3"))), vec![1, 3]);
        assert_eq!(index_list(Some(&Value::from("[2,4]"))), vec![2, 4]);
        assert_eq!(
            index_list(Some(&serde_json::json!([0, 2]))),
            vec![0, 2]
        );
    }

    struct QueuedNlp {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<NlpMessage>>>,
    }

    #[async_trait]
    impl NlpClient for QueuedNlp {
        async fn chat(&self, messages: &[NlpMessage]) -> crate::error::Result<NlpResponse> {
            self.seen.lock().push(messages.to_vec());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(CoreError::nlp(NlpErrorKind::EmptyResponse, "drained"));
            }
            Ok(NlpResponse::new(replies.remove(0)))
        }
    }

    #[tokio::test]
    async fn test_retry_feeds_error_back() {
        let nlp = QueuedNlp {
            replies: Mutex::new(vec![
                "I think the entities are Alice and Acme.".to_string(),
                "name\nAlice\nAcme\n".to_string(),
            ]),
            seen: Mutex::new(Vec::new()),
        };
        let rows: Vec<Row> = request_rows(
            &nlp,
            vec![NlpMessage::user("extract")],
            TabularFormat::Tsv,
            TAGS,
            3,
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);

        let seen = nlp.seen.lock();
        // Second call saw the original prompt, the bad reply, and the
        // parse-error turn.
        assert_eq!(seen[1].len(), 3);
        assert!(seen[1][2].content.contains("could not be parsed"));
    }

    #[tokio::test]
    async fn test_bad_response_carries_transcript() {
        let nlp = QueuedNlp {
            replies: Mutex::new(vec![
                "nonsense".to_string(),
                "more nonsense".to_string(),
            ]),
            seen: Mutex::new(Vec::new()),
        };
        let err = request_rows::<Row>(
            &nlp,
            vec![NlpMessage::user("extract")],
            TabularFormat::Tsv,
            TAGS,
            2,
        )
        .await
        .unwrap_err();
        match err {
            CoreError::BadResponse { raw, transcript, .. } => {
                assert_eq!(raw, "more nonsense");
                assert_eq!(transcript.len(), 5);
            }
            other => panic!("expected BadResponse, got {other}"),
        }
    }
}
