//! Provisioning operations: the nodes of the dependency graph

use crate::types::{DataLocationRegistration, PermissionGrant, Tag, TagAssociation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-assigned stable name for an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogicalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LogicalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit the executor applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    CreateTag(Tag),
    AssociateTag(TagAssociation),
    RegisterResource(DataLocationRegistration),
    Grant(PermissionGrant),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateTag(_) => OperationKind::CreateTag,
            Operation::AssociateTag(_) => OperationKind::AssociateTag,
            Operation::RegisterResource(_) => OperationKind::RegisterResource,
            Operation::Grant(_) => OperationKind::Grant,
        }
    }

    /// Short human-readable subject: tag key, location ARN or principal
    pub fn subject(&self) -> String {
        match self {
            Operation::CreateTag(tag) => tag.key.clone(),
            Operation::AssociateTag(assoc) => format!("{} -> {}", assoc.tag_key, assoc.resource),
            Operation::RegisterResource(reg) => reg.arn.clone(),
            Operation::Grant(grant) => format!("{} on {}", grant.principal, grant.target),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.subject())
    }
}

/// Discriminant of [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    CreateTag,
    AssociateTag,
    RegisterResource,
    Grant,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateTag => "CreateTag",
            OperationKind::AssociateTag => "AssociateTag",
            OperationKind::RegisterResource => "RegisterResource",
            OperationKind::Grant => "Grant",
        };
        f.write_str(name)
    }
}

/// An operation together with its logical identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub id: LogicalId,
    pub operation: Operation,
}
