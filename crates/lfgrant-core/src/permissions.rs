//! Effective permission evaluation over declared grants

use crate::declarations::DeclarationSet;
use crate::operation::{LogicalId, Operation};
use crate::types::{Permission, PermissionGrant, Principal, Resource, TagAssociation};
use serde::Serialize;
use std::collections::BTreeSet;

/// Union of every applicable grant record for one principal and resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EffectivePermissions {
    pub permissions: BTreeSet<Permission>,
    pub grantable_permissions: BTreeSet<Permission>,
    /// Grants that contributed, in declaration order
    pub sources: Vec<LogicalId>,
}

impl EffectivePermissions {
    pub fn allows(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

/// Permission evaluation engine
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    grants: Vec<(LogicalId, PermissionGrant)>,
    associations: Vec<TagAssociation>,
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect grants and tag associations from declarations
    pub fn from_declarations(decls: &DeclarationSet) -> Self {
        let mut engine = Self::new();
        for (id, op) in decls.operations() {
            match op {
                Operation::Grant(grant) => engine.add_grant(id.clone(), grant.clone()),
                Operation::AssociateTag(assoc) => engine.add_association(assoc.clone()),
                Operation::CreateTag(_) | Operation::RegisterResource(_) => {}
            }
        }
        engine
    }

    /// Grants are additive; an overlapping grant never replaces an earlier one
    pub fn add_grant(&mut self, id: LogicalId, grant: PermissionGrant) {
        self.grants.push((id, grant));
    }

    pub fn add_association(&mut self, association: TagAssociation) {
        self.associations.push(association);
    }

    /// Whether `target` of a grant reaches `resource`
    pub fn target_applies(&self, target: &Resource, resource: &Resource) -> bool {
        if resource.is_covered_by(target) {
            return true;
        }
        match target {
            Resource::TagExpression {
                resource_type,
                tag_key,
                tag_values,
            } => {
                resource.tag_resource_type() == Some(*resource_type)
                    && self.associations.iter().any(|assoc| {
                        assoc.matches_expression(*resource_type, tag_key, tag_values)
                            // tables inherit the tags of their database
                            && resource.is_covered_by(&assoc.resource)
                    })
            }
            _ => false,
        }
    }

    pub fn effective(&self, principal: &Principal, resource: &Resource) -> EffectivePermissions {
        let mut effective = EffectivePermissions::default();
        for (id, grant) in &self.grants {
            if grant.principal != *principal || !self.target_applies(&grant.target, resource) {
                continue;
            }
            effective
                .permissions
                .extend(grant.permissions.iter().cloned());
            effective
                .grantable_permissions
                .extend(grant.grantable_permissions.iter().cloned());
            effective.sources.push(id.clone());
        }
        effective
    }

    /// Check if a principal holds `permission` on a resource
    pub fn check_permission(
        &self,
        principal: &Principal,
        resource: &Resource,
        permission: &Permission,
    ) -> bool {
        self.effective(principal, resource).allows(permission)
    }

    /// Get all grants for a principal
    pub fn grants_for_principal(
        &self,
        principal: &Principal,
    ) -> Vec<(&LogicalId, &PermissionGrant)> {
        self.grants
            .iter()
            .filter(|(_, g)| g.principal == *principal)
            .map(|(id, g)| (id, g))
            .collect()
    }

    /// List all unique principals
    pub fn list_principals(&self) -> BTreeSet<&Principal> {
        self.grants.iter().map(|(_, g)| &g.principal).collect()
    }
}

/// Effective permissions of `principal` on `resource` under `decls`
pub fn effective_permissions(
    decls: &DeclarationSet,
    principal: &Principal,
    resource: &Resource,
) -> EffectivePermissions {
    PermissionEngine::from_declarations(decls).effective(principal, resource)
}
