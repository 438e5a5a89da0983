use chrono::{NaiveDate, TimeDelta};
use ulid::Ulid;

use crate::auth::Principal;
use crate::model::*;

use super::availability::{busy_spans, free_spans};
use super::conflict::validate_span;
use super::{require, Engine, EngineError, Scope};

/// The UTC day as a window, refused when it lies outside the bookable range.
fn day_window(day: NaiveDate) -> Result<Span, EngineError> {
    let window = Span::day(day).ok_or_else(|| EngineError::InvalidInput(format!("date out of range: {day}")))?;
    validate_span(&window)?;
    Ok(window)
}

impl Engine {
    pub async fn get(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.get(id).await.ok_or(EngineError::NotFound(id))
    }

    /// Reservations by start ascending. `Scope::Mine` needs a principal.
    pub async fn list(&self, principal: Option<&Principal>, scope: Scope) -> Result<Vec<Reservation>, EngineError> {
        match scope {
            Scope::All => Ok(self.store.list_all().await),
            Scope::Mine => {
                let owner = require(principal)?;
                Ok(self.store.list_by_owner(owner.id()).await)
            }
        }
    }

    pub async fn list_for_resource(&self, resource_id: &str, window: Option<&Span>) -> Vec<Reservation> {
        self.store.list_by_resource(resource_id, window).await
    }

    /// Busy spans of `resource_id` intersecting the UTC day, as stored.
    pub async fn free_busy(&self, resource_id: &str, day: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let window = day_window(day)?;
        let Some(rs) = self.store.resource_state(resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(busy_spans(&guard, &window))
    }

    /// Free gaps of the UTC day, at least `min_duration` long when given.
    pub async fn free_slots(
        &self,
        resource_id: &str,
        day: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = day_window(day)?;
        let busy = self.free_busy(resource_id, day).await?;
        Ok(free_spans(&window, &busy, min_duration))
    }
}
