mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod store;

pub use availability::{busy_spans, free_spans, merge_overlapping, subtract_intervals};
pub use conflict::{conflicts, find_conflict};
pub use error::EngineError;

use std::sync::Arc;
use std::time::Duration;

use crate::auth::Principal;
use crate::catalog::ResourceCatalog;
use crate::model::*;

use store::ReservationStore;

/// Input to [`Engine::create`].
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub resource_id: ResourceId,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
}

/// Input to [`Engine::update`]. A `None` description keeps the stored one.
#[derive(Debug, Clone)]
pub struct ReservationPatch {
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
}

/// Which reservations [`Engine::list`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Mine,
    All,
}

/// The reservation service: owns every admission decision.
///
/// Mutations run validate → lock → check → write with the resource guard held
/// from the conflict check through the commit, so two requests for
/// overlapping slots on one resource can never both be admitted.
pub struct Engine {
    store: Arc<ReservationStore>,
    catalog: Arc<dyn ResourceCatalog>,
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(store: Arc<ReservationStore>, catalog: Arc<dyn ResourceCatalog>, lock_timeout: Duration) -> Self {
        Self {
            store,
            catalog,
            lock_timeout,
        }
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }
}

/// Mutations require a verified principal.
fn require(principal: Option<&Principal>) -> Result<&Principal, EngineError> {
    principal.ok_or(EngineError::Unauthorized)
}
