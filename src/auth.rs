use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::engine::EngineError;
use crate::limits::MAX_OWNER_ID_LEN;
use crate::model::OwnerId;

/// Header carrying the principal id, set by the upstream identity layer.
pub const PRINCIPAL_HEADER: &str = "x-user-id";

/// A verified caller. Only the authorization layer constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    id: OwnerId,
}

impl Principal {
    /// `None` for a blank or oversized id.
    pub fn new(id: impl Into<OwnerId>) -> Option<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() || id.len() > MAX_OWNER_ID_LEN {
            return None;
        }
        Some(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Shared-secret gate in front of the API plus principal extraction.
#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    token: Option<String>,
}

impl ApiAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Check the bearer token (when configured) and read the principal.
    ///
    /// `Ok(None)` means the request is allowed through but anonymous; mutating
    /// operations will refuse it.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>, EngineError> {
        if let Some(expected) = &self.token {
            let presented = headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(expected.as_str()) {
                return Err(EngineError::Unauthorized);
            }
        }
        Ok(headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Principal::new))
    }
}
