//! Catalog service seam for different Lake Formation implementations

use crate::operation::Operation;
use crate::types::{DataLocationRegistration, PermissionGrant, Tag, TagAssociation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a successful create-if-absent call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The service performed the mutation
    Created,
    /// The entity already existed with identical parameters
    AlreadyPresent,
}

/// Failure reported by a catalog service call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Throttling, timeouts and other failures worth retrying
    #[error("{0}")]
    Transient(String),
    /// Malformed references, access denied, conflicting parameters
    #[error("{0}")]
    Terminal(String),
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Transient(m) | ServiceError::Terminal(m) => m,
        }
    }
}

impl From<ServiceError> for crate::error::Error {
    fn from(err: ServiceError) -> Self {
        crate::error::Error::ExternalService {
            transient: err.is_transient(),
            message: err.message().to_string(),
        }
    }
}

pub type ServiceResult = std::result::Result<ApplyOutcome, ServiceError>;

/// Trait for catalog backends, so the executor can run against the local
/// emulator or real AWS Lake Formation.
///
/// Every call is create-if-absent: an entity that already exists with
/// identical parameters yields [`ApplyOutcome::AlreadyPresent`].
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Register a storage location with the catalog
    async fn register_resource(
        &self,
        catalog_id: &str,
        registration: &DataLocationRegistration,
    ) -> ServiceResult;

    /// Create an LF-Tag
    async fn create_tag(&self, catalog_id: &str, tag: &Tag) -> ServiceResult;

    /// Attach an LF-Tag to a database, table or column subset
    async fn associate_tag(&self, catalog_id: &str, association: &TagAssociation) -> ServiceResult;

    /// Grant permissions to a principal
    async fn grant(&self, catalog_id: &str, grant: &PermissionGrant) -> ServiceResult;
}

/// Dispatch one operation to the matching service call
pub async fn apply_operation(
    service: &dyn CatalogService,
    catalog_id: &str,
    operation: &Operation,
) -> ServiceResult {
    match operation {
        Operation::CreateTag(tag) => service.create_tag(catalog_id, tag).await,
        Operation::AssociateTag(assoc) => service.associate_tag(catalog_id, assoc).await,
        Operation::RegisterResource(reg) => service.register_resource(catalog_id, reg).await,
        Operation::Grant(grant) => service.grant(catalog_id, grant).await,
    }
}

/// Configuration for backend implementations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// Local emulator (no AWS required)
    Emulator {
        /// Optional file to persist state
        state_file: Option<String>,
    },
    /// Real AWS Lake Formation
    Aws {
        /// AWS region
        region: Option<String>,
        /// AWS profile name
        profile: Option<String>,
        /// Custom endpoint (for testing)
        endpoint: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Emulator { state_file: None }
    }
}
