use chrono::TimeDelta;

/// Earliest accepted timestamp: 2000-01-01T00:00:00Z (unix seconds).
pub const MIN_VALID_TIMESTAMP_SECS: i64 = 946_684_800;
/// Latest accepted timestamp: 2100-01-01T00:00:00Z (unix seconds).
pub const MAX_VALID_TIMESTAMP_SECS: i64 = 4_102_444_800;

/// Longest single reservation (31 days). Also bounds the conflict pre-filter window.
pub const MAX_SPAN_DURATION_SECS: i64 = 31 * 86_400;

pub fn max_span_duration() -> TimeDelta {
    TimeDelta::seconds(MAX_SPAN_DURATION_SECS)
}

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_RESOURCE_ID_LEN: usize = 128;
pub const MAX_OWNER_ID_LEN: usize = 128;

pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

/// Depth of the group-commit channel in front of the WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// Largest encoded event. Every valid reservation fits many times over;
/// a bigger length header on replay marks a torn tail.
pub const MAX_WAL_FRAME_LEN: usize = 64 * 1024;
