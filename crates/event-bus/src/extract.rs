//! # Aggregate-ID Extraction
//!
//! Sources are tried in strict priority order; the first usable value wins:
//!
//! | # | Source | Notes |
//! |---|--------|-------|
//! | 1 | Envelope `aggregate_id` | payload decodes as an [`Envelope`] |
//! | 2 | `X-Aggregate-ID` header | case variants accepted |
//! | 3 | Broker key | Kafka message key |
//! | 4 | Subject segment | per [`SubjectPattern`] |
//!
//! Every candidate must pass [`is_valid_aggregate_id`] after trimming.

use std::collections::HashMap;

use bus_types::{is_valid_aggregate_id, Envelope, NoAggregateId};
use serde::{Deserialize, Serialize};

/// Header names checked for an aggregate id, in order.
pub const AGGREGATE_ID_HEADERS: [&str; 4] =
    ["X-Aggregate-ID", "x-aggregate-id", "Aggregate-ID", "aggregate-id"];

/// Canonical header written by publishers.
pub const AGGREGATE_ID_HEADER: &str = AGGREGATE_ID_HEADERS[0];

/// Which segment of a dotted subject carries the aggregate id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "index")]
pub enum SubjectPattern {
    /// Never read the subject.
    Disabled,
    /// Scan from the last segment backwards, first valid one wins.
    #[default]
    LastValidSegment,
    /// Fixed index. Negative values count from the end (`-1` is the last).
    Segment(i32),
}

impl SubjectPattern {
    /// Apply the pattern to a `.`-separated subject.
    #[must_use]
    pub fn extract(&self, subject: &str) -> Option<String> {
        let segments: Vec<&str> = subject.split('.').collect();
        match *self {
            Self::Disabled => None,
            Self::LastValidSegment => segments
                .iter()
                .rev()
                .map(|s| s.trim())
                .find(|s| is_valid_aggregate_id(s))
                .map(str::to_string),
            Self::Segment(index) => {
                let len = i32::try_from(segments.len()).ok()?;
                let resolved = if index < 0 { len + index } else { index };
                let segment = segments.get(usize::try_from(resolved).ok()?)?.trim();
                is_valid_aggregate_id(segment).then(|| segment.to_string())
            }
        }
    }
}

/// Find the aggregate id of an inbound message.
///
/// # Errors
///
/// [`NoAggregateId`] when none of the four sources yields a valid value.
pub fn extract_aggregate_id(
    raw: &[u8],
    headers: &HashMap<String, String>,
    key: Option<&str>,
    subject: Option<&str>,
    pattern: SubjectPattern,
) -> Result<String, NoAggregateId> {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(raw) {
        let id = envelope.aggregate_id.trim();
        if is_valid_aggregate_id(id) {
            return Ok(id.to_string());
        }
    }

    for name in AGGREGATE_ID_HEADERS {
        if let Some(value) = headers.get(name) {
            let value = value.trim();
            if is_valid_aggregate_id(value) {
                return Ok(value.to_string());
            }
        }
    }

    if let Some(key) = key.map(str::trim) {
        if is_valid_aggregate_id(key) {
            return Ok(key.to_string());
        }
    }

    subject
        .and_then(|s| pattern.extract(s))
        .ok_or(NoAggregateId)
}
