use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::model::*;
use crate::observability::{outcome_label, ADMISSIONS_TOTAL};

use super::conflict::*;
use super::{require, Engine, EngineError, NewReservation, ReservationPatch};

fn record<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = outcome_label(&result.as_ref().map(|_| ()));
    metrics::counter!(ADMISSIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    match result {
        Ok(_) => {}
        Err(e @ (EngineError::Busy(_) | EngineError::LimitExceeded(_) | EngineError::WalError(_))) => {
            warn!("{op} failed: {e}")
        }
        Err(e) => debug!("{op} rejected: {e}"),
    }
}

impl Engine {
    pub async fn create(
        &self,
        principal: Option<&Principal>,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let result = self.admit_new(principal, request).await;
        record("create", &result);
        result
    }

    async fn admit_new(
        &self,
        principal: Option<&Principal>,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let owner = require(principal)?;
        validate_resource_id(&request.resource_id)?;
        let title = validate_title(&request.title)?;
        let description = match request.description {
            Some(d) => normalize_description(d)?,
            None => None,
        };
        validate_span(&request.span)?;
        if !self.catalog.exists(&request.resource_id).await {
            return Err(EngineError::ResourceNotFound(request.resource_id));
        }

        let mut txn = self.store.begin(&request.resource_id, self.lock_timeout).await?;
        if let Some(other) = find_conflict(txn.state(), &request.span, None) {
            return Err(EngineError::SlotConflict(other));
        }

        let now = now();
        let reservation = Reservation {
            id: Ulid::new(),
            resource_id: request.resource_id,
            owner_id: owner.id().to_string(),
            title,
            description,
            span: request.span,
            created_at: now,
            updated_at: now,
        };
        let committed = txn.insert(reservation).await?;
        info!(
            "reservation {} committed on {} [{}, {}) for {}",
            committed.id, committed.resource_id, committed.span.start, committed.span.end, committed.owner_id
        );
        Ok(committed)
    }

    /// Re-validate and re-check `id` against every other reservation on its resource.
    /// Resource, owner and creation time never change.
    pub async fn update(
        &self,
        principal: Option<&Principal>,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let result = self.admit_update(principal, id, patch).await;
        record("update", &result);
        result
    }

    async fn admit_update(
        &self,
        principal: Option<&Principal>,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        require(principal)?;
        let title = validate_title(&patch.title)?;
        let description = patch.description.map(normalize_description).transpose()?;
        validate_span(&patch.span)?;

        let resource_id = self.store.resource_of(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = self.store.begin(&resource_id, self.lock_timeout).await?;
        // Deleted while we waited for the guard.
        let current = txn.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if let Some(other) = find_conflict(txn.state(), &patch.span, Some(id)) {
            return Err(EngineError::SlotConflict(other));
        }

        let description = description.unwrap_or_else(|| current.description.clone());
        let updated_at = now().max(current.created_at);
        let updated = Reservation {
            title,
            description,
            span: patch.span,
            updated_at,
            ..current
        };
        let committed = txn.replace(updated).await?;
        info!(
            "reservation {} moved to [{}, {}) on {}",
            committed.id, committed.span.start, committed.span.end, committed.resource_id
        );
        Ok(committed)
    }

    /// Remove a reservation. A second delete of the same id reports `NotFound`
    /// and changes nothing.
    pub async fn delete(&self, principal: Option<&Principal>, id: Ulid) -> Result<Reservation, EngineError> {
        let result: Result<Reservation, EngineError> = async {
            require(principal)?;
            Ok(self.store.delete(id, self.lock_timeout).await?)
        }
        .await;
        record("delete", &result);
        if let Ok(removed) = &result {
            info!("reservation {} deleted from {}", removed.id, removed.resource_id);
        }
        result
    }
}
