use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now() -> Ts {
    chrono::Utc::now()
}

/// True iff `candidate` overlaps any span in `existing`. Touching spans do not conflict.
pub fn conflicts(candidate: &Span, existing: &[Span]) -> bool {
    existing.iter().any(|e| candidate.overlaps(e))
}

/// First committed reservation on `rs` overlapping `candidate`, ignoring `exclude`.
pub fn find_conflict(rs: &ResourceState, candidate: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(candidate)
        .filter(|r| Some(r.id) != exclude)
        .find(|r| conflicts(candidate, std::slice::from_ref(&r.span)))
        .map(|r| r.id)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("start must be before end".into()));
    }
    if span.start.timestamp() < MIN_VALID_TIMESTAMP_SECS
        || span.end.timestamp() > MAX_VALID_TIMESTAMP_SECS
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration() > max_span_duration() {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Trimmed, non-empty, bounded title.
pub(crate) fn validate_title(title: &str) -> Result<String, EngineError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(EngineError::InvalidInput("title must not be empty".into()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(title.to_string())
}

/// Bounded free text. Blank collapses to `None`.
pub(crate) fn normalize_description(description: String) -> Result<Option<String>, EngineError> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if description.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(description))
}

pub(crate) fn validate_resource_id(id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidInput("resourceId must not be empty".into()));
    }
    if id.len() > MAX_RESOURCE_ID_LEN {
        return Err(EngineError::LimitExceeded("resourceId too long"));
    }
    Ok(())
}
