//! Temporal operations: fact dating, contradiction discovery, lifespan
//! math.
//!
//! Facts live on edges as `valid_from`/`valid_to` spans. Dating asks the
//! NLP layer to pin a fresh fact's span from the episode text; discovery
//! asks which existing facts a new one contradicts; invalidation is pure
//! lifespan math that closes contradicted spans at the new fact's start.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::{debug, warn};

use predicato_graph::{Edge, Episode, Node};

use crate::error::Result;
use crate::nlp::NlpClient;
use crate::prompts::{self, temporal::ContradictionRow, temporal::EdgeDatesRow};
use crate::tabular::{self, TabularFormat, DEFAULT_PARSE_ATTEMPTS};

/// Facts starting further than this ahead of now draw a warning.
const FUTURE_TOLERANCE_HOURS: i64 = 24;

/// Parse an RFC3339 timestamp, tolerating surrounding quotes and
/// whitespace, normalized to UTC. Bare dates read as midnight UTC.
pub fn parse_rfc3339_utc(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0)?,
            Utc,
        ));
    }
    None
}

/// Format a timestamp the way prompts and stored documents expect.
pub fn format_rfc3339_utc(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The fact sentence describing an edge, for prompt context.
pub fn edge_fact(edge: &Edge) -> String {
    if edge.summary.is_empty() {
        format!("{} relation between two entities", edge.name)
    } else {
        edge.summary.clone()
    }
}

/// Temporal reasoning over facts.
pub struct TemporalOperations {
    nlp: Arc<dyn NlpClient>,
    format: TabularFormat,
    parse_attempts: usize,
}

impl TemporalOperations {
    pub fn new(nlp: Arc<dyn NlpClient>) -> Self {
        Self {
            nlp,
            format: TabularFormat::Tsv,
            parse_attempts: DEFAULT_PARSE_ATTEMPTS,
        }
    }

    pub fn with_format(mut self, format: TabularFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_parse_attempts(mut self, attempts: usize) -> Self {
        self.parse_attempts = attempts;
        self
    }

    /// Ask when `edge`'s fact became (and possibly stopped being) true.
    ///
    /// The reference timestamp is the episode's validity start.
    /// Unparseable values are logged and left `None`.
    pub async fn extract_edge_dates(
        &self,
        edge: &Edge,
        episode: &Episode,
        previous: &[Node],
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        let messages = prompts::temporal::extract_edge_dates(
            &edge_fact(edge),
            episode,
            previous,
            episode.reference_time,
            self.format,
        );
        let row: Option<EdgeDatesRow> = tabular::request_row(
            self.nlp.as_ref(),
            messages,
            self.format,
            &prompts::tags(prompts::temporal::DATE_FIELDS),
            self.parse_attempts,
        )
        .await?;
        let Some(row) = row else {
            return Ok((None, None));
        };

        let valid_at = row.valid_at.as_deref().and_then(|raw| {
            let parsed = parse_rfc3339_utc(raw);
            if parsed.is_none() && !raw.trim().is_empty() {
                warn!(raw, "unparseable valid_at, leaving unset");
            }
            parsed
        });
        let invalid_at = row.invalid_at.as_deref().and_then(|raw| {
            let parsed = parse_rfc3339_utc(raw);
            if parsed.is_none() && !raw.trim().is_empty() {
                warn!(raw, "unparseable invalid_at, leaving unset");
            }
            parsed
        });
        Ok((valid_at, invalid_at))
    }

    /// Ask which of `candidates` the new edge contradicts. Candidates are
    /// indexed by position and returned by position.
    pub async fn find_contradictions(
        &self,
        new_edge: &Edge,
        candidates: &[Edge],
    ) -> Result<Vec<usize>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let facts: Vec<String> = candidates.iter().map(edge_fact).collect();
        let messages = prompts::temporal::find_contradictions(
            &edge_fact(new_edge),
            &facts,
            new_edge.valid_from,
            self.format,
        );
        let rows: Vec<ContradictionRow> = tabular::request_rows(
            self.nlp.as_ref(),
            messages,
            self.format,
            &prompts::tags(prompts::temporal::CONTRADICTION_FIELDS),
            self.parse_attempts,
        )
        .await?;

        let mut indices: Vec<usize> = rows
            .into_iter()
            .filter_map(|row| usize::try_from(row.id).ok())
            .filter(|&index| index < candidates.len())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        debug!(contradicted = indices.len(), of = candidates.len(), "contradiction discovery");
        Ok(indices)
    }

    /// Close the spans of candidates the new edge supersedes.
    ///
    /// A candidate is invalidated when its span is open across the new
    /// edge's `valid_from`: it began earlier and either never ended or
    /// ends after that instant. Invalidated candidates get
    /// `valid_to = new.valid_from` and a fresh `updated_at`. Candidates
    /// already expired, or starting at or after the new fact, are left
    /// alone and omitted from the output.
    pub fn invalidate_overlapping(new_edge: &Edge, candidates: Vec<Edge>) -> Vec<Edge> {
        let cutoff = new_edge.valid_from;
        candidates
            .into_iter()
            .filter(|candidate| {
                candidate.valid_from < cutoff
                    && candidate.valid_to.map_or(true, |end| end > cutoff)
            })
            .map(|mut candidate| {
                candidate.valid_to = Some(cutoff);
                candidate.updated_at = Utc::now();
                candidate
            })
            .collect()
    }

    /// Sanity-check an edge's temporal fields, returning warnings.
    pub fn check_consistency(edge: &Edge) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(valid_to) = edge.valid_to {
            if valid_to < edge.valid_from {
                warnings.push(format!(
                    "edge {}: valid_to {} precedes valid_from {}",
                    edge.uuid,
                    format_rfc3339_utc(valid_to),
                    format_rfc3339_utc(edge.valid_from)
                ));
            }
            if valid_to < edge.created_at {
                warnings.push(format!(
                    "edge {}: fact expired before the graph learned it",
                    edge.uuid
                ));
            }
        }
        if edge.valid_from > Utc::now() + Duration::hours(FUTURE_TOLERANCE_HOURS) {
            warnings.push(format!(
                "edge {}: valid_from {} lies more than {FUTURE_TOLERANCE_HOURS}h in the future",
                edge.uuid,
                format_rfc3339_utc(edge.valid_from)
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::new_uuid;

    #[test]
    fn test_parse_roundtrip_normalizes_to_utc() {
        let original: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();
        let parsed = parse_rfc3339_utc(&format_rfc3339_utc(original)).unwrap();
        assert_eq!(parsed, original);

        // Offset timestamps normalize.
        let offset = parse_rfc3339_utc("2024-06-01T14:00:00+02:00").unwrap();
        assert_eq!(offset, original);
    }

    #[test]
    fn test_parse_tolerates_quotes_and_bare_dates() {
        assert_eq!(
            parse_rfc3339_utc("\"2024-06-01T00:00:00Z\""),
            parse_rfc3339_utc("2024-06-01")
        );
        assert!(parse_rfc3339_utc("null").is_none());
        assert!(parse_rfc3339_utc("sometime in June").is_none());
    }

    fn edge_with_span(valid_from: &str, valid_to: Option<&str>) -> Edge {
        let mut edge = Edge::entity("g", new_uuid(), new_uuid(), "WORKS_FOR", "a fact")
            .with_valid_from(valid_from.parse().unwrap());
        edge.valid_to = valid_to.map(|raw| raw.parse().unwrap());
        edge
    }

    #[test]
    fn test_invalidation_closes_open_overlapping_spans() {
        let new_edge = edge_with_span("2024-06-01T00:00:00Z", None);
        let open_older = edge_with_span("2022-01-01T00:00:00Z", None);
        let closed_after = edge_with_span("2022-01-01T00:00:00Z", Some("2025-01-01T00:00:00Z"));
        let expired = edge_with_span("2020-01-01T00:00:00Z", Some("2021-01-01T00:00:00Z"));
        let later = edge_with_span("2024-07-01T00:00:00Z", None);

        let invalidated = TemporalOperations::invalidate_overlapping(
            &new_edge,
            vec![open_older.clone(), closed_after.clone(), expired, later],
        );
        assert_eq!(invalidated.len(), 2);
        for edge in &invalidated {
            assert_eq!(edge.valid_to, Some(new_edge.valid_from));
        }
        assert!(invalidated.iter().any(|e| e.uuid == open_older.uuid));
        assert!(invalidated.iter().any(|e| e.uuid == closed_after.uuid));
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_format_roundtrip(secs in 0i64..4_102_444_800) {
            let instant = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            proptest::prop_assert_eq!(
                parse_rfc3339_utc(&format_rfc3339_utc(instant)),
                Some(instant)
            );
        }
    }

    #[test]
    fn test_consistency_flags_reversed_and_future_spans() {
        let reversed = edge_with_span("2024-06-01T00:00:00Z", Some("2024-01-01T00:00:00Z"));
        assert!(!TemporalOperations::check_consistency(&reversed).is_empty());

        let mut future = Edge::entity("g", new_uuid(), new_uuid(), "WILL_JOIN", "");
        future.valid_from = Utc::now() + Duration::days(30);
        let warnings = TemporalOperations::check_consistency(&future);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("in the future"));

        let fine = edge_with_span("2024-01-01T00:00:00Z", Some("2024-06-01T00:00:00Z"));
        // Expired before created_at draws the audit warning only.
        let warnings = TemporalOperations::check_consistency(&fine);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("before the graph learned it"));
    }
}
