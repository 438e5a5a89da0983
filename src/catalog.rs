use std::collections::HashSet;

use async_trait::async_trait;

/// Foreign-key collaborator: does a resource id exist in the room catalog?
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn exists(&self, resource_id: &str) -> bool;
}

/// Treats every resource id as valid. Used when no catalog is configured.
#[derive(Debug, Default)]
pub struct OpenCatalog;

#[async_trait]
impl ResourceCatalog for OpenCatalog {
    async fn exists(&self, _resource_id: &str) -> bool {
        true
    }
}

/// Fixed set of known resource ids.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    ids: HashSet<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ResourceCatalog for StaticCatalog {
    async fn exists(&self, resource_id: &str) -> bool {
        self.ids.contains(resource_id)
    }
}
