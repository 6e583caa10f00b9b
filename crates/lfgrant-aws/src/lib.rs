//! # AWS Lake Formation Catalog Service
//!
//! Real AWS Lake Formation implementation of [`CatalogService`].

use anyhow::Result;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_lakeformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_lakeformation::types::{
    DataLakePrincipal, DataLocationResource, DatabaseResource, LfTag, LfTagPair,
    LfTagPolicyResource, Permission as LfPermission, Resource as LfResource, ResourceType,
    TableResource, TableWildcard, TableWithColumnsResource,
};
use aws_sdk_lakeformation::{Client, Config};
use lfgrant_core::{
    ApplyOutcome, CatalogService, DataLocationRegistration, Permission, PermissionGrant,
    Principal, Resource, ServiceError, ServiceResult, TableName, Tag, TagAssociation,
    TagResourceType,
};
use std::collections::BTreeSet;

/// Error codes Lake Formation returns for conditions worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "ConcurrentModificationException",
    "InternalServiceException",
    "OperationTimeoutException",
];

const ALREADY_EXISTS: &str = "AlreadyExistsException";

/// AWS Lake Formation catalog service
pub struct AwsCatalog {
    client: Client,
    region: String,
}

impl AwsCatalog {
    /// Create a catalog service with custom configuration
    pub async fn with_config(
        region: Option<String>,
        profile: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &region {
            loader = loader.region(Region::new(region.clone()));
        }

        if let Some(profile) = profile {
            loader = loader.profile_name(&profile);
        }

        let aws_config = loader.load().await;

        // custom endpoint for LocalStack and friends
        let mut lf_config = Config::from(&aws_config).to_builder();
        if let Some(endpoint) = endpoint {
            lf_config = lf_config.endpoint_url(endpoint);
        }

        let client = Client::from_conf(lf_config.build());

        let region = aws_config
            .region()
            .map(|r| r.as_ref().to_string())
            .unwrap_or_else(|| "us-east-1".to_string());
        tracing::debug!(%region, "created Lake Formation client");

        Ok(Self { client, region })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Compare an existing tag against the declared one after AlreadyExists
    async fn existing_tag_matches(&self, catalog_id: &str, tag: &Tag) -> ServiceResult {
        let existing = self
            .client
            .get_lf_tag()
            .catalog_id(catalog_id)
            .tag_key(&tag.key)
            .send()
            .await
            .map_err(classify)?;

        let existing: BTreeSet<&str> = existing.tag_values().iter().map(String::as_str).collect();
        let declared: BTreeSet<&str> = tag.values.iter().map(String::as_str).collect();
        if existing == declared {
            Ok(ApplyOutcome::AlreadyPresent)
        } else {
            Err(ServiceError::terminal(format!(
                "tag `{}` already exists with values {:?}",
                tag.key, existing
            )))
        }
    }
}

#[async_trait]
impl CatalogService for AwsCatalog {
    async fn register_resource(
        &self,
        catalog_id: &str,
        registration: &DataLocationRegistration,
    ) -> ServiceResult {
        // RegisterResource is account scoped and takes no catalog id
        tracing::debug!(catalog_id, arn = %registration.arn, "registering resource");
        let request = self
            .client
            .register_resource()
            .resource_arn(&registration.arn)
            .use_service_linked_role(registration.use_service_linked_role)
            .set_role_arn(registration.role_arn.clone());

        match request.send().await {
            Ok(_) => Ok(ApplyOutcome::Created),
            Err(err) if error_code(&err) == Some(ALREADY_EXISTS) => {
                Ok(ApplyOutcome::AlreadyPresent)
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn create_tag(&self, catalog_id: &str, tag: &Tag) -> ServiceResult {
        let request = self
            .client
            .create_lf_tag()
            .catalog_id(catalog_id)
            .tag_key(&tag.key)
            .set_tag_values(Some(tag.values.clone()));

        match request.send().await {
            Ok(_) => Ok(ApplyOutcome::Created),
            Err(err) if error_code(&err) == Some(ALREADY_EXISTS) => {
                self.existing_tag_matches(catalog_id, tag).await
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn associate_tag(&self, catalog_id: &str, association: &TagAssociation) -> ServiceResult {
        let pair = LfTagPair::builder()
            .catalog_id(catalog_id)
            .tag_key(&association.tag_key)
            .set_tag_values(Some(association.tag_values.iter().cloned().collect()))
            .build()
            .map_err(|e| ServiceError::terminal(format!("building tag pair: {e}")))?;
        let resource = convert_resource(catalog_id, &association.resource)?;

        let output = self
            .client
            .add_lf_tags_to_resource()
            .catalog_id(catalog_id)
            .resource(resource)
            .lf_tags(pair)
            .send()
            .await
            .map_err(classify)?;

        // partial failures come back in the response body
        if let Some(failure) = output.failures().first() {
            let detail = failure.error();
            let code = detail.and_then(|d| d.error_code()).unwrap_or("unknown");
            let message = detail.and_then(|d| d.error_message()).unwrap_or_default();
            let message = format!("{code}: {message}");
            return Err(if TRANSIENT_CODES.contains(&code) {
                ServiceError::transient(message)
            } else {
                ServiceError::terminal(message)
            });
        }
        Ok(ApplyOutcome::Created)
    }

    async fn grant(&self, catalog_id: &str, grant: &PermissionGrant) -> ServiceResult {
        let principal = convert_principal(&grant.principal);
        let resource = convert_resource(catalog_id, &grant.target)?;

        let mut request = self
            .client
            .grant_permissions()
            .catalog_id(catalog_id)
            .principal(principal)
            .resource(resource)
            .set_permissions(Some(convert_permissions(&grant.permissions)));

        if !grant.grantable_permissions.is_empty() {
            request = request.set_permissions_with_grant_option(Some(convert_permissions(
                &grant.grantable_permissions,
            )));
        }

        // GrantPermissions is idempotent on the service side
        request.send().await.map_err(classify)?;
        Ok(ApplyOutcome::Created)
    }
}

fn error_code<E, R>(err: &SdkError<E, R>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(context) => context.err().code(),
        _ => None,
    }
}

/// Sort an SDK failure into retryable and terminal
fn classify<E, R>(err: SdkError<E, R>) -> ServiceError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(context) => context
            .err()
            .code()
            .map(|code| TRANSIENT_CODES.contains(&code))
            .unwrap_or(false),
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        ServiceError::transient(message)
    } else {
        ServiceError::terminal(message)
    }
}

fn convert_principal(principal: &Principal) -> DataLakePrincipal {
    DataLakePrincipal::builder()
        .data_lake_principal_identifier(&principal.identifier)
        .build()
}

fn convert_permissions(permissions: &BTreeSet<Permission>) -> Vec<LfPermission> {
    permissions
        .iter()
        .map(|p| LfPermission::from(p.as_str()))
        .collect()
}

fn build_failed(what: &str, err: impl std::fmt::Display) -> ServiceError {
    ServiceError::terminal(format!("building {what} resource: {err}"))
}

fn convert_resource(
    catalog_id: &str,
    resource: &Resource,
) -> std::result::Result<LfResource, ServiceError> {
    let builder = LfResource::builder();
    let builder = match resource {
        Resource::Database { name } => builder.database(
            DatabaseResource::builder()
                .catalog_id(catalog_id)
                .name(name)
                .build()
                .map_err(|e| build_failed("database", e))?,
        ),
        Resource::Table { database, name } => {
            let table = TableResource::builder()
                .catalog_id(catalog_id)
                .database_name(database);
            let table = match name {
                TableName::Named(name) => table.name(name),
                TableName::Wildcard => table.table_wildcard(TableWildcard::builder().build()),
            };
            builder.table(table.build().map_err(|e| build_failed("table", e))?)
        }
        Resource::TableWithColumns {
            database,
            name,
            columns,
        } => builder.table_with_columns(
            TableWithColumnsResource::builder()
                .catalog_id(catalog_id)
                .database_name(database)
                .name(name)
                .set_column_names(Some(columns.iter().cloned().collect()))
                .build()
                .map_err(|e| build_failed("table with columns", e))?,
        ),
        Resource::DataLocation { arn } => builder.data_location(
            DataLocationResource::builder()
                .catalog_id(catalog_id)
                .resource_arn(arn)
                .build()
                .map_err(|e| build_failed("data location", e))?,
        ),
        Resource::TagExpression {
            resource_type,
            tag_key,
            tag_values,
        } => {
            let expression = LfTag::builder()
                .tag_key(tag_key)
                .set_tag_values(Some(tag_values.iter().cloned().collect()))
                .build()
                .map_err(|e| build_failed("tag expression", e))?;
            builder.lf_tag_policy(
                LfTagPolicyResource::builder()
                    .catalog_id(catalog_id)
                    .resource_type(match resource_type {
                        TagResourceType::Database => ResourceType::Database,
                        TagResourceType::Table => ResourceType::Table,
                    })
                    .expression(expression)
                    .build()
                    .map_err(|e| build_failed("tag policy", e))?,
            )
        }
    };
    Ok(builder.build())
}

/// Build the AWS catalog service from CLI-level settings
pub async fn create_aws_catalog(
    region: Option<String>,
    profile: Option<String>,
    endpoint: Option<String>,
) -> Result<AwsCatalog> {
    AwsCatalog::with_config(region, profile, endpoint).await
}
