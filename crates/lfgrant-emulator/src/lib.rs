//! # Lake Formation catalog emulator
//!
//! In-memory [`CatalogService`] for local runs and tests. Calls follow
//! create-if-absent semantics, reject dangling references the way the real
//! service does, count the mutations they perform and can be scripted to
//! fail. State can optionally be persisted to a JSON file between runs.

use async_trait::async_trait;
use lfgrant_core::{
    location_contains, ApplyOutcome, CatalogService, DataLocationRegistration,
    EffectivePermissions, Operation, OperationKind, PermissionEngine, PermissionGrant, Principal,
    Resource, ServiceError, ServiceResult, Tag, TagAssociation,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

pub mod faults;
pub mod storage;

pub use faults::FaultPlan;
pub use storage::FileStorage;

/// Everything one catalog holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogState {
    /// tag key -> definition
    pub tags: BTreeMap<String, Tag>,
    /// location ARN -> registration
    pub locations: BTreeMap<String, DataLocationRegistration>,
    pub associations: Vec<TagAssociation>,
    /// Grants are additive records, never merged
    pub grants: Vec<PermissionGrant>,
}

impl CatalogState {
    pub fn create_tag(&mut self, tag: &Tag) -> ServiceResult {
        match self.tags.get(&tag.key) {
            Some(existing) if same_values(&existing.values, &tag.values) => {
                Ok(ApplyOutcome::AlreadyPresent)
            }
            Some(existing) => Err(ServiceError::terminal(format!(
                "AlreadyExistsException: tag `{}` exists with values {:?}",
                tag.key, existing.values
            ))),
            None => {
                self.tags.insert(tag.key.clone(), tag.clone());
                Ok(ApplyOutcome::Created)
            }
        }
    }

    pub fn associate_tag(&mut self, association: &TagAssociation) -> ServiceResult {
        self.check_tag_values(&association.tag_key, &association.tag_values)?;

        let existing = self
            .associations
            .iter()
            .find(|a| a.tag_key == association.tag_key && a.resource == association.resource);
        match existing {
            Some(a) if a.tag_values == association.tag_values => Ok(ApplyOutcome::AlreadyPresent),
            Some(a) => Err(ServiceError::terminal(format!(
                "InvalidInputException: {} already carries tag `{}` with values {:?}",
                a.resource, a.tag_key, a.tag_values
            ))),
            None => {
                self.associations.push(association.clone());
                Ok(ApplyOutcome::Created)
            }
        }
    }

    pub fn register_resource(&mut self, registration: &DataLocationRegistration) -> ServiceResult {
        match self.locations.get(&registration.arn) {
            Some(existing) if existing == registration => Ok(ApplyOutcome::AlreadyPresent),
            Some(_) => Err(ServiceError::terminal(format!(
                "AlreadyExistsException: {} is registered with different settings",
                registration.arn
            ))),
            None => {
                self.locations
                    .insert(registration.arn.clone(), registration.clone());
                Ok(ApplyOutcome::Created)
            }
        }
    }

    pub fn grant(&mut self, grant: &PermissionGrant) -> ServiceResult {
        match &grant.target {
            Resource::TagExpression {
                tag_key,
                tag_values,
                ..
            } => self.check_tag_values(tag_key, tag_values)?,
            Resource::DataLocation { arn } => {
                let registered = self
                    .locations
                    .keys()
                    .any(|location| location_contains(location, arn));
                if !registered {
                    return Err(ServiceError::terminal(format!(
                        "InvalidInputException: location {arn} is not registered"
                    )));
                }
            }
            _ => {}
        }

        if self.grants.contains(grant) {
            return Ok(ApplyOutcome::AlreadyPresent);
        }
        self.grants.push(grant.clone());
        Ok(ApplyOutcome::Created)
    }

    /// Evaluator over what this catalog currently holds
    pub fn permission_engine(&self) -> PermissionEngine {
        let mut engine = PermissionEngine::new();
        for association in &self.associations {
            engine.add_association(association.clone());
        }
        for (i, grant) in self.grants.iter().enumerate() {
            engine.add_grant(format!("grant-{}", i + 1).into(), grant.clone());
        }
        engine
    }

    fn check_tag_values(&self, key: &str, values: &BTreeSet<String>) -> Result<(), ServiceError> {
        let tag = self.tags.get(key).ok_or_else(|| {
            ServiceError::terminal(format!("EntityNotFoundException: tag `{key}` does not exist"))
        })?;
        if let Some(value) = values.iter().find(|v| !tag.allows(v)) {
            return Err(ServiceError::terminal(format!(
                "InvalidInputException: value `{value}` is not defined for tag `{key}`"
            )));
        }
        Ok(())
    }
}

fn same_values(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Complete state of the emulator, keyed by catalog id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmulatorState {
    pub catalogs: BTreeMap<String, CatalogState>,
}

impl EmulatorState {
    pub fn catalog(&self, catalog_id: &str) -> Option<&CatalogState> {
        self.catalogs.get(catalog_id)
    }

    pub fn catalog_mut(&mut self, catalog_id: &str) -> &mut CatalogState {
        self.catalogs.entry(catalog_id.to_string()).or_default()
    }
}

/// Lake Formation emulator backend
#[derive(Debug, Default)]
pub struct EmulatorBackend {
    state: Mutex<EmulatorState>,
    /// Optional file for persistence
    storage: Option<FileStorage>,
    faults: StdMutex<FaultPlan>,
    latency: Duration,
    calls: AtomicUsize,
    mutations: AtomicUsize,
}

impl EmulatorBackend {
    /// Empty in-memory catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulator persisted to `state_file`, loading it when present
    pub async fn open(state_file: Option<impl Into<PathBuf>>) -> anyhow::Result<Self> {
        let Some(path) = state_file else {
            return Ok(Self::new());
        };
        let storage = FileStorage::new(path);
        let state = storage.load().await?;
        tracing::info!(path = %storage.path().display(), "opened emulator state");
        Ok(Self {
            state: Mutex::new(state),
            storage: Some(storage),
            ..Self::default()
        })
    }

    /// Delay every call, to make concurrency observable
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` calls of `kind` whose subject is `subject`.
    /// Subjects are those of [`Operation::subject`].
    pub fn inject_fault(
        &self,
        kind: OperationKind,
        subject: impl Into<String>,
        error: ServiceError,
        times: usize,
    ) {
        self.faults().inject(kind, subject, error, times);
    }

    /// Calls received, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that changed state
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> EmulatorState {
        self.state.lock().await.clone()
    }

    /// Effective permissions according to what has been applied
    pub async fn effective_permissions(
        &self,
        catalog_id: &str,
        principal: &Principal,
        resource: &Resource,
    ) -> EffectivePermissions {
        match self.state.lock().await.catalog(catalog_id) {
            Some(catalog) => catalog.permission_engine().effective(principal, resource),
            None => EffectivePermissions::default(),
        }
    }

    fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn apply<F>(&self, catalog_id: &str, operation: Operation, f: F) -> ServiceResult
    where
        F: FnOnce(&mut CatalogState) -> ServiceResult,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let kind = operation.kind();
        let subject = operation.subject();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = self.faults().take(kind, &subject);
        if let Some(err) = injected {
            tracing::debug!(%kind, %subject, error = %err, "injected failure");
            return Err(err);
        }

        let mut state = self.state.lock().await;
        let outcome = f(state.catalog_mut(catalog_id))?;
        if outcome == ApplyOutcome::Created {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            if let Some(storage) = &self.storage {
                storage.save(&state).await.map_err(|e| {
                    ServiceError::terminal(format!("persisting emulator state: {e:#}"))
                })?;
            }
        }
        tracing::debug!(%kind, %subject, ?outcome, "emulator applied");
        Ok(outcome)
    }
}

#[async_trait]
impl CatalogService for EmulatorBackend {
    async fn register_resource(
        &self,
        catalog_id: &str,
        registration: &DataLocationRegistration,
    ) -> ServiceResult {
        let operation = Operation::RegisterResource(registration.clone());
        self.apply(catalog_id, operation, |c| c.register_resource(registration))
            .await
    }

    async fn create_tag(&self, catalog_id: &str, tag: &Tag) -> ServiceResult {
        let operation = Operation::CreateTag(tag.clone());
        self.apply(catalog_id, operation, |c| c.create_tag(tag)).await
    }

    async fn associate_tag(&self, catalog_id: &str, association: &TagAssociation) -> ServiceResult {
        let operation = Operation::AssociateTag(association.clone());
        self.apply(catalog_id, operation, |c| c.associate_tag(association))
            .await
    }

    async fn grant(&self, catalog_id: &str, grant: &PermissionGrant) -> ServiceResult {
        let operation = Operation::Grant(grant.clone());
        self.apply(catalog_id, operation, |c| c.grant(grant)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfgrant_core::{permission_set, TagResourceType};
    use tempfile::TempDir;

    const CATALOG: &str = "123456789012";

    fn privacy() -> Tag {
        Tag::new("privacy", ["open"]).unwrap()
    }

    fn reviews() -> Resource {
        Resource::table_with_columns("default", "reviews", ["product_id", "product_title"]).unwrap()
    }

    fn tag_grant() -> PermissionGrant {
        PermissionGrant {
            principal: Principal::user("ds-1").unwrap(),
            target: Resource::tag_expression(TagResourceType::Table, "privacy", ["open"]).unwrap(),
            permissions: permission_set(["SELECT"]).unwrap(),
            grantable_permissions: permission_set(["SELECT"]).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let backend = EmulatorBackend::new();
        assert_eq!(
            backend.create_tag(CATALOG, &privacy()).await,
            Ok(ApplyOutcome::Created)
        );
        assert_eq!(
            backend.create_tag(CATALOG, &privacy()).await,
            Ok(ApplyOutcome::AlreadyPresent)
        );
        let closed = Tag::new("privacy", ["closed"]).unwrap();
        assert!(matches!(
            backend.create_tag(CATALOG, &closed).await,
            Err(ServiceError::Terminal(_))
        ));
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.mutations(), 1);
    }

    #[tokio::test]
    async fn test_dangling_references_are_terminal() {
        let backend = EmulatorBackend::new();
        let assoc = TagAssociation::new("privacy", ["open"], reviews()).unwrap();
        assert!(matches!(
            backend.associate_tag(CATALOG, &assoc).await,
            Err(ServiceError::Terminal(m)) if m.contains("EntityNotFoundException")
        ));
        assert!(backend.grant(CATALOG, &tag_grant()).await.is_err());

        let location_grant = PermissionGrant {
            principal: Principal::role("arn:aws:iam::1:role/workflow").unwrap(),
            target: Resource::data_location("arn:aws:s3:::lake/raw").unwrap(),
            permissions: permission_set(["DATA_LOCATION_ACCESS"]).unwrap(),
            grantable_permissions: BTreeSet::new(),
        };
        assert!(backend.grant(CATALOG, &location_grant).await.is_err());
        backend
            .register_resource(
                CATALOG,
                &DataLocationRegistration::service_linked("arn:aws:s3:::lake").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            backend.grant(CATALOG, &location_grant).await,
            Ok(ApplyOutcome::Created)
        );
        assert_eq!(backend.mutations(), 2);

        // a sibling bucket sharing the name prefix is not registered
        let sibling_grant = PermissionGrant {
            target: Resource::data_location("arn:aws:s3:::lakehouse").unwrap(),
            ..location_grant
        };
        assert!(matches!(
            backend.grant(CATALOG, &sibling_grant).await,
            Err(ServiceError::Terminal(m)) if m.contains("not registered")
        ));
    }

    #[tokio::test]
    async fn test_grants_are_additive_and_evaluated() {
        let backend = EmulatorBackend::new();
        backend.create_tag(CATALOG, &privacy()).await.unwrap();
        backend
            .associate_tag(
                CATALOG,
                &TagAssociation::new("privacy", ["open"], reviews()).unwrap(),
            )
            .await
            .unwrap();
        backend.grant(CATALOG, &tag_grant()).await.unwrap();
        assert_eq!(
            backend.grant(CATALOG, &tag_grant()).await,
            Ok(ApplyOutcome::AlreadyPresent)
        );

        let mut narrower = tag_grant();
        narrower.grantable_permissions.clear();
        assert_eq!(
            backend.grant(CATALOG, &narrower).await,
            Ok(ApplyOutcome::Created)
        );

        let state = backend.state().await;
        assert_eq!(state.catalog(CATALOG).unwrap().grants.len(), 2);
        let effective = backend
            .effective_permissions(CATALOG, &Principal::user("ds-1").unwrap(), &reviews())
            .await;
        assert_eq!(effective.grantable_permissions, permission_set(["SELECT"]).unwrap());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let backend = EmulatorBackend::new();
        backend.inject_fault(
            OperationKind::CreateTag,
            "privacy",
            ServiceError::transient("ThrottlingException"),
            1,
        );
        assert!(matches!(
            backend.create_tag(CATALOG, &privacy()).await,
            Err(ServiceError::Transient(_))
        ));
        assert_eq!(
            backend.create_tag(CATALOG, &privacy()).await,
            Ok(ApplyOutcome::Created)
        );
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("emulator.json");

        let backend = EmulatorBackend::open(Some(&path)).await.unwrap();
        backend.create_tag(CATALOG, &privacy()).await.unwrap();
        drop(backend);

        let reopened = EmulatorBackend::open(Some(&path)).await.unwrap();
        assert_eq!(
            reopened.create_tag(CATALOG, &privacy()).await,
            Ok(ApplyOutcome::AlreadyPresent)
        );
        assert_eq!(reopened.mutations(), 0);
    }
}
