use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// UTC instant. The only time type.
pub type Ts = DateTime<Utc>;

/// Opaque identifier of a bookable resource, owned by the external catalog.
pub type ResourceId = String;

/// Opaque identifier of a verified principal.
pub type OwnerId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The UTC day `[date 00:00, date+1 00:00)`. `None` for the last representable date.
    pub fn day(date: NaiveDate) -> Option<Self> {
        let next = date.succ_opt()?;
        Some(Self::new(
            date.and_time(chrono::NaiveTime::MIN).and_utc(),
            next.and_time(chrono::NaiveTime::MIN).and_utc(),
        ))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Clamp to `window`. Caller guarantees the two overlap.
    pub fn clamp_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// A committed claim on a resource by a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub owner_id: OwnerId,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub created_at: Ts,
    pub updated_at: Ts,
}

/// All committed reservations of one resource.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    /// Sorted by `span.start`. Disjoint by construction.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start; equal starts keep arrival order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL record format. Flat, one variant per committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        resource_id: ResourceId,
        title: String,
        description: Option<String>,
        span: Span,
        updated_at: Ts,
    },
    ReservationDeleted {
        id: Ulid,
        resource_id: ResourceId,
    },
}

impl Event {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Event::ReservationCreated { reservation } => &reservation.resource_id,
            Event::ReservationUpdated { resource_id, .. }
            | Event::ReservationDeleted { resource_id, .. } => resource_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Ts {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn reservation(start: Ts, end: Ts) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: "r1".into(),
            owner_id: "u1".into(),
            title: "standup".into(),
            description: None,
            span: Span::new(start, end),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(at(9, 0), at(10, 0));
        assert_eq!(s.duration(), TimeDelta::hours(1));
        assert!(s.overlaps(&Span::new(at(9, 59), at(11, 0))));
        assert!(!s.overlaps(&Span::new(at(10, 0), at(11, 0)))); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(at(9, 0), at(10, 0));
        let b = Span::new(at(9, 30), at(10, 30));
        let c = Span::new(at(10, 0), at(11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn day_span_is_utc_midnight_to_midnight() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let s = Span::day(d).unwrap();
        assert_eq!(s.start, Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap());
        assert_eq!(s.end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn last_representable_day_has_no_span() {
        assert_eq!(Span::day(NaiveDate::MAX), None);
    }

    #[test]
    fn clamp_to_window() {
        let window = Span::new(at(9, 0), at(12, 0));
        let s = Span::new(at(8, 0), at(10, 0));
        assert_eq!(s.clamp_to(&window), Span::new(at(9, 0), at(10, 0)));
    }

    #[test]
    fn reservation_ordering() {
        let mut rs = ResourceState::new("r1".into());
        rs.insert_reservation(reservation(at(14, 0), at(15, 0)));
        rs.insert_reservation(reservation(at(9, 0), at(10, 0)));
        rs.insert_reservation(reservation(at(11, 0), at(12, 0)));
        let starts: Vec<_> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![at(9, 0), at(11, 0), at(14, 0)]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = ResourceState::new("r1".into());
        let a = reservation(at(9, 0), at(10, 0));
        let b = reservation(at(10, 0), at(11, 0));
        let c = reservation(at(11, 0), at(12, 0));
        let (ida, idb, idc) = (a.id, b.id, c.id);
        rs.insert_reservation(a);
        rs.insert_reservation(b);
        rs.insert_reservation(c);
        assert_eq!(rs.remove_reservation(idb).map(|r| r.id), Some(idb));
        assert_eq!(rs.reservations.len(), 2);
        assert_eq!(rs.reservations[0].id, ida);
        assert_eq!(rs.reservations[1].id, idc);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new("r1".into());
        rs.insert_reservation(reservation(at(9, 0), at(10, 0)));
        assert!(rs.remove_reservation(Ulid::new()).is_none());
        assert_eq!(rs.reservations.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new("r1".into());
        rs.insert_reservation(reservation(at(7, 0), at(8, 0)));
        rs.insert_reservation(reservation(at(9, 30), at(10, 30)));
        rs.insert_reservation(reservation(at(13, 0), at(14, 0)));

        let query = Span::new(at(10, 0), at(12, 0));
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(at(9, 30), at(10, 30)));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new("r1".into());
        rs.insert_reservation(reservation(at(9, 0), at(10, 0)));
        let query = Span::new(at(10, 0), at(11, 0));
        assert_eq!(rs.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_empty_resource() {
        let rs = ResourceState::new("r1".into());
        let query = Span::new(at(0, 0), at(23, 0));
        assert_eq!(rs.overlapping(&query).count(), 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: reservation(at(9, 0), at(10, 0)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.resource_id(), "r1");
    }
}
