//! Declaration arena and grant resolver
//!
//! A [`DeclarationSet`] owns every operation of a run, keyed by logical
//! identifier, together with the catalog identity, principal provenance and
//! explicit ordering edges. Declaring is a single synchronous pass with no
//! external calls; the set is consumed by the planner once complete.

use crate::error::{Error, Result};
use crate::operation::{LogicalId, Operation, PlannedOperation};
use crate::types::{
    DataLocationRegistration, Permission, PermissionGrant, Principal, Resource, Tag,
    TagAssociation,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// "`after` must not start before `before` has succeeded"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExplicitEdge {
    pub before: LogicalId,
    pub after: LogicalId,
}

/// Where a principal comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalOrigin {
    pub principal: Principal,
    pub created_by: LogicalId,
}

/// Every declared entity of one run
#[derive(Debug, Clone, Default)]
pub struct DeclarationSet {
    catalog_id: String,
    order: Vec<LogicalId>,
    operations: HashMap<LogicalId, Operation>,
    /// tag key -> id of its CreateTag
    tag_keys: HashMap<String, LogicalId>,
    /// location ARN -> id of its RegisterResource
    locations: HashMap<String, LogicalId>,
    /// duplicate declarations folded into a canonical id
    aliases: HashMap<LogicalId, LogicalId>,
    principals: BTreeMap<String, PrincipalOrigin>,
    edges: Vec<ExplicitEdge>,
}

impl DeclarationSet {
    pub fn new(catalog_id: impl Into<String>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            ..Default::default()
        }
    }

    pub fn catalog_id(&self) -> &str {
        &self.catalog_id
    }

    pub fn set_catalog_id(&mut self, catalog_id: impl Into<String>) {
        self.catalog_id = catalog_id.into();
    }

    /// Declare a tag. Re-declaring a key with identical values under another
    /// id is folded into the first declaration; different values are invalid.
    pub fn declare_tag(&mut self, id: impl Into<LogicalId>, tag: Tag) -> Result<LogicalId> {
        let id = id.into();
        if let Some(existing_id) = self.tag_keys.get(&tag.key).cloned() {
            if existing_id != id && !self.operations.contains_key(&id) {
                let existing = self.operations.get(&existing_id);
                return match existing {
                    Some(Operation::CreateTag(existing)) if same_values(existing, &tag) => {
                        self.alias(id, existing_id.clone())?;
                        Ok(existing_id)
                    }
                    Some(Operation::CreateTag(existing)) => Err(Error::validation(format!(
                        "tag `{}` is declared by `{}` with values {:?} and by `{}` with values {:?}",
                        tag.key, existing_id, existing.values, id, tag.values
                    ))),
                    _ => Err(Error::validation(format!(
                        "tag `{}` index points at a non-tag operation",
                        tag.key
                    ))),
                };
            }
        }

        let key = tag.key.clone();
        let canonical = self.insert_operation(id, Operation::CreateTag(tag))?;
        self.tag_keys.entry(key).or_insert_with(|| canonical.clone());
        Ok(canonical)
    }

    pub fn associate_tag(
        &mut self,
        id: impl Into<LogicalId>,
        association: TagAssociation,
    ) -> Result<LogicalId> {
        self.insert_operation(id.into(), Operation::AssociateTag(association))
    }

    /// Declare a data-location registration. Registering the same ARN twice
    /// with identical settings is folded like duplicate tags.
    pub fn register_location(
        &mut self,
        id: impl Into<LogicalId>,
        registration: DataLocationRegistration,
    ) -> Result<LogicalId> {
        let id = id.into();
        if let Some(existing_id) = self.locations.get(&registration.arn).cloned() {
            if existing_id != id && !self.operations.contains_key(&id) {
                return match self.operations.get(&existing_id) {
                    Some(Operation::RegisterResource(existing)) if *existing == registration => {
                        self.alias(id, existing_id.clone())?;
                        Ok(existing_id)
                    }
                    _ => Err(Error::validation(format!(
                        "location `{}` is registered by both `{}` and `{}` with different settings",
                        registration.arn, existing_id, id
                    ))),
                };
            }
        }

        let arn = registration.arn.clone();
        let canonical = self.insert_operation(id, Operation::RegisterResource(registration))?;
        self.locations.entry(arn).or_insert_with(|| canonical.clone());
        Ok(canonical)
    }

    /// Resolve a grant request into a `Grant` operation.
    ///
    /// Grants are additive: a second grant for the same principal and target
    /// is a separate record and never replaces the first.
    pub fn submit_grant(
        &mut self,
        id: impl Into<LogicalId>,
        principal: Principal,
        target: Resource,
        permissions: BTreeSet<Permission>,
        grantable_permissions: BTreeSet<Permission>,
    ) -> Result<LogicalId> {
        let id = id.into();
        if permissions.is_empty() {
            return Err(Error::validation(format!(
                "grant `{id}` to {principal} lists no permissions"
            )));
        }
        let not_held: Vec<&str> = grantable_permissions
            .difference(&permissions)
            .map(Permission::as_str)
            .collect();
        if !not_held.is_empty() {
            return Err(Error::validation(format!(
                "grant `{id}` makes {} grantable without granting {}",
                not_held.join(", "),
                if not_held.len() == 1 { "it" } else { "them" }
            )));
        }

        let grant = PermissionGrant {
            principal,
            target,
            permissions,
            grantable_permissions,
        };
        self.warn_on_overlap(&id, &grant);
        self.insert_operation(id, Operation::Grant(grant))
    }

    /// Record that `principal` is created by the declared operation `created_by`.
    /// Grants to it will wait for that operation.
    pub fn declare_principal(
        &mut self,
        principal: Principal,
        created_by: impl Into<LogicalId>,
    ) -> Result<()> {
        let created_by = created_by.into();
        match self.principals.get(&principal.identifier) {
            Some(origin) if origin.principal == principal && origin.created_by == created_by => {
                Ok(())
            }
            Some(origin) => Err(Error::Conflict {
                id: created_by,
                message: format!(
                    "principal '{}' is already declared as {} created by `{}`",
                    principal.identifier, origin.principal, origin.created_by
                ),
            }),
            None => {
                self.principals.insert(
                    principal.identifier.clone(),
                    PrincipalOrigin {
                        principal,
                        created_by,
                    },
                );
                Ok(())
            }
        }
    }

    /// Declare that `after` depends on `before`, on top of implicit edges
    pub fn add_dependency(&mut self, after: impl Into<LogicalId>, before: impl Into<LogicalId>) {
        let edge = ExplicitEdge {
            before: before.into(),
            after: after.into(),
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Operations in declaration order
    pub fn operations(&self) -> impl Iterator<Item = (&LogicalId, &Operation)> {
        self.order
            .iter()
            .filter_map(move |id| self.operations.get(id).map(|op| (id, op)))
    }

    pub fn get(&self, id: &LogicalId) -> Option<&Operation> {
        self.operations.get(self.resolve(id)?)
    }

    /// Canonical id for `id`, following duplicate-declaration aliases
    pub fn resolve<'a>(&'a self, id: &'a LogicalId) -> Option<&'a LogicalId> {
        let canonical = self.aliases.get(id).unwrap_or(id);
        self.operations.contains_key(canonical).then_some(canonical)
    }

    pub fn tag(&self, key: &str) -> Option<&Tag> {
        match self.operations.get(self.tag_keys.get(key)?) {
            Some(Operation::CreateTag(tag)) => Some(tag),
            _ => None,
        }
    }

    pub fn tag_operation(&self, key: &str) -> Option<&LogicalId> {
        self.tag_keys.get(key)
    }

    pub fn principal_origin(&self, identifier: &str) -> Option<&PrincipalOrigin> {
        self.principals.get(identifier)
    }

    pub fn principals(&self) -> impl Iterator<Item = &PrincipalOrigin> {
        self.principals.values()
    }

    pub fn edges(&self) -> &[ExplicitEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Snapshot of all operations in declaration order
    pub fn planned_operations(&self) -> Vec<PlannedOperation> {
        self.operations()
            .map(|(id, op)| PlannedOperation {
                id: id.clone(),
                operation: op.clone(),
            })
            .collect()
    }

    fn insert_operation(&mut self, id: LogicalId, operation: Operation) -> Result<LogicalId> {
        if id.as_str().trim().is_empty() {
            return Err(Error::validation(format!(
                "{operation} has an empty logical identifier"
            )));
        }

        let canonical = self.aliases.get(&id).cloned().unwrap_or(id);
        match self.operations.get(&canonical) {
            Some(existing) if *existing == operation => Ok(canonical),
            Some(existing) => Err(Error::conflict(
                &canonical,
                format!("already declared as {existing}, redeclared as {operation}"),
            )),
            None => {
                self.order.push(canonical.clone());
                self.operations.insert(canonical.clone(), operation);
                Ok(canonical)
            }
        }
    }

    fn alias(&mut self, alias: LogicalId, canonical: LogicalId) -> Result<()> {
        match self.aliases.get(&alias) {
            Some(existing) if *existing != canonical => Err(Error::conflict(
                &alias,
                format!("already names `{existing}`, cannot also name `{canonical}`"),
            )),
            _ => {
                tracing::debug!(%alias, %canonical, "folding duplicate declaration");
                self.aliases.insert(alias, canonical);
                Ok(())
            }
        }
    }

    fn warn_on_overlap(&self, id: &LogicalId, grant: &PermissionGrant) {
        for (other_id, op) in self.operations() {
            let Operation::Grant(other) = op else { continue };
            if other_id == id
                || other.principal != grant.principal
                || other.target != grant.target
                || (other.permissions == grant.permissions
                    && other.grantable_permissions == grant.grantable_permissions)
            {
                continue;
            }
            // Both records stay in effect; nothing here retracts the earlier one.
            tracing::warn!(
                grant = %id,
                earlier = %other_id,
                principal = %grant.principal,
                target = %grant.target,
                "overlapping grants with different permission sets are not reconciled"
            );
        }
    }
}

/// Tag values are an unordered set
fn same_values(a: &Tag, b: &Tag) -> bool {
    let a: BTreeSet<&String> = a.values.iter().collect();
    let b: BTreeSet<&String> = b.values.iter().collect();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::permission_set;

    fn select() -> BTreeSet<Permission> {
        permission_set(["SELECT"]).unwrap()
    }

    fn ds1() -> Principal {
        Principal::user("ds-1").unwrap()
    }

    #[test]
    fn test_grantable_must_be_subset() {
        let mut decls = DeclarationSet::new("123456789012");
        let err = decls
            .submit_grant(
                "g1",
                ds1(),
                Resource::database("default").unwrap(),
                select(),
                permission_set(["SELECT", "DESCRIBE"]).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("DESCRIBE"));
        assert!(decls.is_empty());
    }

    #[test]
    fn test_grant_requires_permissions() {
        let mut decls = DeclarationSet::new("123456789012");
        let err = decls
            .submit_grant(
                "g1",
                ds1(),
                Resource::database("default").unwrap(),
                BTreeSet::new(),
                BTreeSet::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_same_id_same_grant_is_idempotent() {
        let mut decls = DeclarationSet::new("123456789012");
        let target = Resource::database("default").unwrap();
        decls
            .submit_grant("g1", ds1(), target.clone(), select(), select())
            .unwrap();
        decls
            .submit_grant("g1", ds1(), target, select(), select())
            .unwrap();
        assert_eq!(decls.len(), 1);
    }

    #[test]
    fn test_same_id_different_grant_conflicts() {
        let mut decls = DeclarationSet::new("123456789012");
        let target = Resource::database("default").unwrap();
        decls
            .submit_grant("g1", ds1(), target.clone(), select(), select())
            .unwrap();
        let err = decls
            .submit_grant("g1", ds1(), target, select(), BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { ref id, .. } if id.as_str() == "g1"));
    }

    #[test]
    fn test_overlapping_grants_stay_separate() {
        let mut decls = DeclarationSet::new("123456789012");
        let target = Resource::table("default", "reviews").unwrap();
        decls
            .submit_grant(
                "broad",
                ds1(),
                target.clone(),
                permission_set(["DESCRIBE", "SELECT"]).unwrap(),
                permission_set(["DESCRIBE"]).unwrap(),
            )
            .unwrap();
        decls
            .submit_grant("narrow", ds1(), target, select(), select())
            .unwrap();
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn test_duplicate_tag_key() {
        let mut decls = DeclarationSet::new("123456789012");
        let first = decls
            .declare_tag("privacy_tag", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();

        // identical values under another id fold into the first declaration
        let again = decls
            .declare_tag("privacy_again", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(decls.len(), 1);
        assert_eq!(
            decls.resolve(&LogicalId::from("privacy_again")),
            Some(&first)
        );

        let err = decls
            .declare_tag("privacy_closed", Tag::new("privacy", ["closed"]).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_tag_value_order_is_not_significant() {
        let mut decls = DeclarationSet::new("123456789012");
        let first = decls
            .declare_tag("status_tag", Tag::new("status", ["open", "closed"]).unwrap())
            .unwrap();
        let reordered = decls
            .declare_tag("status_again", Tag::new("status", ["closed", "open"]).unwrap())
            .unwrap();
        assert_eq!(reordered, first);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls.resolve(&LogicalId::from("status_again")), Some(&first));
    }

    #[test]
    fn test_redeclared_tag_id_with_other_values_conflicts() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .declare_tag("env", Tag::new("environment", ["production"]).unwrap())
            .unwrap();
        let err = decls
            .declare_tag("env", Tag::new("stage", ["dev"]).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_principal_is_immutable() {
        let mut decls = DeclarationSet::new("123456789012");
        let role = Principal::role("arn:aws:iam::1:role/etl").unwrap();
        decls.declare_principal(role.clone(), "make_role").unwrap();
        decls.declare_principal(role, "make_role").unwrap();

        let as_user = Principal::user("arn:aws:iam::1:role/etl").unwrap();
        let err = decls.declare_principal(as_user, "make_role").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_operations_keep_declaration_order() {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .register_location(
                "lake",
                DataLocationRegistration::service_linked("arn:aws:s3:::lake").unwrap(),
            )
            .unwrap();
        decls
            .declare_tag("env", Tag::new("environment", ["production"]).unwrap())
            .unwrap();
        let ids: Vec<&str> = decls.operations().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["lake", "env"]);
    }
}
