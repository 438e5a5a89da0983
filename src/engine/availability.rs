use chrono::TimeDelta;

use crate::model::*;

// ── Free/busy projection ────────────────────────────────────────

/// Stored spans of every reservation intersecting `window`, unclipped, by start.
pub fn busy_spans(resource: &ResourceState, window: &Span) -> Vec<Span> {
    resource.overlapping(window).map(|r| r.span).collect()
}

/// Gaps in `window` not covered by `busy`, dropping any shorter than `min_duration`.
/// `busy` must be sorted by start; it may extend past the window.
pub fn free_spans(window: &Span, busy: &[Span], min_duration: Option<TimeDelta>) -> Vec<Span> {
    let clipped: Vec<Span> = busy
        .iter()
        .filter(|s| s.overlaps(window))
        .map(|s| s.clamp_to(window))
        .collect();
    let mut free = subtract_intervals(&[*window], &merge_overlapping(&clipped));
    if let Some(min) = min_duration {
        free.retain(|s| s.duration() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
