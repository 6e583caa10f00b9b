//! Core data types for catalog resources, tags and grants
//!
//! Constructors validate shape only. Anything that needs to look at more than
//! one entity (does the tag exist, does the association cover the expression)
//! belongs to the validator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of identity a grant can be made to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrincipalKind {
    /// IAM user (arn:aws:iam::123456789012:user/alice)
    User,
    /// IAM role (arn:aws:iam::123456789012:role/data-scientist)
    Role,
    /// SAML or IAM Identity Center group
    Group,
}

/// Represents a principal (user, role, group) that can receive grants
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub identifier: String,
}

impl Principal {
    pub fn new(kind: PrincipalKind, identifier: impl Into<String>) -> Result<Self> {
        let identifier = identifier.into();
        require_non_empty("principal identifier", &identifier)?;
        Ok(Self { kind, identifier })
    }

    pub fn user(identifier: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::User, identifier)
    }

    pub fn role(identifier: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::Role, identifier)
    }

    pub fn group(identifier: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::Group, identifier)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PrincipalKind::User => "USER",
            PrincipalKind::Role => "ROLE",
            PrincipalKind::Group => "GROUP",
        };
        write!(f, "{} '{}'", kind, self.identifier)
    }
}

/// Table selector: a named table or every table in the database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Named(String),
    Wildcard,
}

/// Resource types a tag expression can range over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagResourceType {
    Database,
    Table,
}

impl TagResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagResourceType::Database => "DATABASE",
            TagResourceType::Table => "TABLE",
        }
    }
}

impl std::str::FromStr for TagResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DATABASE" => Ok(TagResourceType::Database),
            "TABLE" => Ok(TagResourceType::Table),
            other => Err(Error::validation(format!(
                "unknown tag expression resource type `{other}` (expected DATABASE or TABLE)"
            ))),
        }
    }
}

/// A catalog resource or tag expression that grants and tags attach to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// Entire database
    Database { name: String },
    /// A table, or every table of the database
    Table { database: String, name: TableName },
    /// A column subset of one table
    TableWithColumns {
        database: String,
        name: String,
        columns: BTreeSet<String>,
    },
    /// Registered storage location (S3 ARN)
    DataLocation { arn: String },
    /// Every resource of `resource_type` carrying `tag_key` with one of `tag_values`
    TagExpression {
        resource_type: TagResourceType,
        tag_key: String,
        tag_values: BTreeSet<String>,
    },
}

impl Resource {
    pub fn database(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        require_non_empty("database name", &name)?;
        Ok(Resource::Database { name })
    }

    pub fn table(database: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let (database, name) = (database.into(), name.into());
        require_non_empty("database name", &database)?;
        require_non_empty("table name", &name)?;
        Ok(Resource::Table {
            database,
            name: TableName::Named(name),
        })
    }

    pub fn table_wildcard(database: impl Into<String>) -> Result<Self> {
        let database = database.into();
        require_non_empty("database name", &database)?;
        Ok(Resource::Table {
            database,
            name: TableName::Wildcard,
        })
    }

    pub fn table_with_columns<I, S>(
        database: impl Into<String>,
        name: impl Into<String>,
        columns: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (database, name) = (database.into(), name.into());
        require_non_empty("database name", &database)?;
        require_non_empty("table name", &name)?;
        let columns = non_empty_set("column", columns)?;
        Ok(Resource::TableWithColumns {
            database,
            name,
            columns,
        })
    }

    pub fn data_location(arn: impl Into<String>) -> Result<Self> {
        let arn = arn.into();
        require_non_empty("data location ARN", &arn)?;
        Ok(Resource::DataLocation { arn })
    }

    pub fn tag_expression<I, S>(
        resource_type: TagResourceType,
        tag_key: impl Into<String>,
        tag_values: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tag_key = tag_key.into();
        require_non_empty("tag key", &tag_key)?;
        let tag_values = non_empty_set("tag value", tag_values)?;
        Ok(Resource::TagExpression {
            resource_type,
            tag_key,
            tag_values,
        })
    }

    /// Database this resource lives in, if it is database-scoped
    pub fn database_name(&self) -> Option<&str> {
        match self {
            Resource::Database { name } => Some(name),
            Resource::Table { database, .. } | Resource::TableWithColumns { database, .. } => {
                Some(database)
            }
            Resource::DataLocation { .. } | Resource::TagExpression { .. } => None,
        }
    }

    /// Kind of resource a tag expression would have to select to match this one
    pub fn tag_resource_type(&self) -> Option<TagResourceType> {
        match self {
            Resource::Database { .. } => Some(TagResourceType::Database),
            Resource::Table { .. } | Resource::TableWithColumns { .. } => {
                Some(TagResourceType::Table)
            }
            Resource::DataLocation { .. } | Resource::TagExpression { .. } => None,
        }
    }

    /// Whether tags attached to this resource are seen by a tag expression
    /// over `resource_type`. Tables inherit the tags of their database.
    pub fn is_reachable_by(&self, resource_type: TagResourceType) -> bool {
        match (self, resource_type) {
            (Resource::Database { .. }, _) => true,
            (
                Resource::Table { .. } | Resource::TableWithColumns { .. },
                TagResourceType::Table,
            ) => true,
            _ => false,
        }
    }

    /// Check if this resource is contained within or matches another resource.
    /// Tag expressions never cover anything here; they are resolved through
    /// associations by the permission evaluator.
    pub fn is_covered_by(&self, other: &Resource) -> bool {
        match (self, other) {
            (a, b) if a == b => true,

            // Database grants reach every table in the database
            (
                Resource::Table { database: db1, .. }
                | Resource::TableWithColumns { database: db1, .. },
                Resource::Database { name: db2 },
            ) => db1 == db2,

            // Wildcard covers every named table and its columns
            (
                Resource::Table { database: db1, .. }
                | Resource::TableWithColumns { database: db1, .. },
                Resource::Table {
                    database: db2,
                    name: TableName::Wildcard,
                },
            ) => db1 == db2,

            // A whole-table grant covers any column subset
            (
                Resource::TableWithColumns {
                    database: db1,
                    name: t1,
                    ..
                },
                Resource::Table {
                    database: db2,
                    name: TableName::Named(t2),
                },
            ) => db1 == db2 && t1 == t2,

            (
                Resource::TableWithColumns {
                    database: db1,
                    name: t1,
                    columns: c1,
                },
                Resource::TableWithColumns {
                    database: db2,
                    name: t2,
                    columns: c2,
                },
            ) => db1 == db2 && t1 == t2 && c1.is_subset(c2),

            (Resource::DataLocation { arn: p1 }, Resource::DataLocation { arn: p2 }) => {
                location_contains(p2, p1)
            }

            _ => false,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Database { name } => write!(f, "DATABASE {name}"),
            Resource::Table {
                database,
                name: TableName::Named(name),
            } => write!(f, "TABLE {database}.{name}"),
            Resource::Table {
                database,
                name: TableName::Wildcard,
            } => write!(f, "TABLE {database}.*"),
            Resource::TableWithColumns {
                database,
                name,
                columns,
            } => {
                let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
                write!(f, "TABLE {database}.{name} COLUMNS ({})", cols.join(", "))
            }
            Resource::DataLocation { arn } => write!(f, "LOCATION '{arn}'"),
            Resource::TagExpression {
                resource_type,
                tag_key,
                tag_values,
            } => {
                let values: Vec<String> = tag_values.iter().map(|v| format!("'{v}'")).collect();
                write!(
                    f,
                    "TAGGED {} {tag_key} IN ({})",
                    resource_type.as_str(),
                    values.join(", ")
                )
            }
        }
    }
}

/// Lake Formation tag definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub values: Vec<String>,
}

impl Tag {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        require_non_empty("tag key", &key)?;

        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(Error::validation(format!("tag `{key}` has no values")));
        }
        let mut seen = BTreeSet::new();
        for value in &values {
            require_non_empty("tag value", value)?;
            if !seen.insert(value.as_str()) {
                return Err(Error::validation(format!(
                    "tag `{key}` lists value `{value}` more than once"
                )));
            }
        }

        Ok(Self { key, values })
    }

    pub fn allows(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Binding of a tag (with a subset of its values) to one catalog resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagAssociation {
    pub tag_key: String,
    pub tag_values: BTreeSet<String>,
    pub resource: Resource,
}

impl TagAssociation {
    pub fn new<I, S>(tag_key: impl Into<String>, tag_values: I, resource: Resource) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tag_key = tag_key.into();
        require_non_empty("tag key", &tag_key)?;
        let tag_values = non_empty_set("tag value", tag_values)?;

        match resource {
            Resource::Database { .. }
            | Resource::Table { .. }
            | Resource::TableWithColumns { .. } => {}
            Resource::DataLocation { .. } | Resource::TagExpression { .. } => {
                return Err(Error::validation(format!(
                    "tag `{tag_key}` cannot be associated to {resource}"
                )));
            }
        }

        Ok(Self {
            tag_key,
            tag_values,
            resource,
        })
    }

    /// Associate every value of `tag`
    pub fn with_all_values(tag: &Tag, resource: Resource) -> Result<Self> {
        Self::new(tag.key.clone(), tag.values.iter().cloned(), resource)
    }

    /// Whether this association satisfies a tag expression over `resource_type`
    pub fn matches_expression(
        &self,
        resource_type: TagResourceType,
        tag_key: &str,
        tag_values: &BTreeSet<String>,
    ) -> bool {
        self.tag_key == tag_key
            && self.resource.is_reachable_by(resource_type)
            && !self.tag_values.is_disjoint(tag_values)
    }
}

/// Whether `arn` is `location` itself or a path below it. `s3:::lake` contains
/// `s3:::lake/raw` but not `s3:::lakehouse`.
pub fn location_contains(location: &str, arn: &str) -> bool {
    match arn.strip_prefix(location) {
        Some("") => true,
        Some(rest) => location.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// A storage location registered with the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLocationRegistration {
    pub arn: String,
    pub use_service_linked_role: bool,
    pub role_arn: Option<String>,
}

impl DataLocationRegistration {
    /// Register using the Lake Formation service-linked role
    pub fn service_linked(arn: impl Into<String>) -> Result<Self> {
        let arn = arn.into();
        require_non_empty("data location ARN", &arn)?;
        Ok(Self {
            arn,
            use_service_linked_role: true,
            role_arn: None,
        })
    }

    /// Register with a caller-supplied role
    pub fn with_role(arn: impl Into<String>, role_arn: impl Into<String>) -> Result<Self> {
        let (arn, role_arn) = (arn.into(), role_arn.into());
        require_non_empty("data location ARN", &arn)?;
        require_non_empty("registration role ARN", &role_arn)?;
        Ok(Self {
            arn,
            use_service_linked_role: false,
            role_arn: Some(role_arn),
        })
    }
}

/// A permission name such as `SELECT` or `DATA_LOCATION_ACCESS`, upper-cased
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().trim();
        require_non_empty("permission", name)?;
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(format!("malformed permission `{name}`")));
        }
        Ok(Self(name.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a list of permission names into a set
pub fn permission_set<I, S>(names: I) -> Result<BTreeSet<Permission>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(Permission::new).collect()
}

/// A complete permission grant record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub principal: Principal,
    pub target: Resource,
    pub permissions: BTreeSet<Permission>,
    pub grantable_permissions: BTreeSet<Permission>,
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::validation(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn non_empty_set<I, S>(what: &str, items: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut set = BTreeSet::new();
    for item in items {
        let item = item.into();
        require_non_empty(what, &item)?;
        set.insert(item);
    }
    if set.is_empty() {
        return Err(Error::validation(format!("at least one {what} is required")));
    }
    Ok(set)
}
