//! Pre-flight checks over a complete declaration set
//!
//! Runs before the graph is built and before any external call. Every issue
//! is collected so one `plan` run reports all of them at once.

use crate::declarations::DeclarationSet;
use crate::error::{Error, Result};
use crate::operation::{LogicalId, Operation};
use crate::types::{Resource, TagAssociation, TagResourceType};
use std::collections::BTreeSet;

/// Cross-entity validation of a frozen [`DeclarationSet`]
pub struct Validator<'a> {
    decls: &'a DeclarationSet,
    issues: Vec<String>,
}

impl<'a> Validator<'a> {
    pub fn new(decls: &'a DeclarationSet) -> Self {
        Self {
            decls,
            issues: Vec::new(),
        }
    }

    /// Run every check, failing with a single `ValidationError` listing all issues
    pub fn validate(mut self) -> Result<()> {
        let decls = self.decls;
        if decls.catalog_id().trim().is_empty() {
            self.issues
                .push("catalog id is empty (set CATALOG or --catalog-id)".to_string());
        }

        for (id, op) in decls.operations() {
            match op {
                Operation::AssociateTag(assoc) => self.check_association(id, assoc),
                Operation::Grant(grant) => {
                    if let Resource::TagExpression {
                        resource_type,
                        tag_key,
                        tag_values,
                    } = &grant.target
                    {
                        self.check_expression(id, *resource_type, tag_key, tag_values);
                    }
                }
                Operation::CreateTag(_) | Operation::RegisterResource(_) => {}
            }
        }

        for origin in decls.principals() {
            if decls.resolve(&origin.created_by).is_none() {
                self.issues.push(format!(
                    "{} is created by unknown operation `{}`",
                    origin.principal, origin.created_by
                ));
            }
        }

        for edge in decls.edges() {
            self.check_known(&edge.before, &edge.after);
            self.check_known(&edge.after, &edge.before);
            if edge.before == edge.after {
                self.issues
                    .push(format!("`{}` is declared to depend on itself", edge.after));
            }
        }

        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(self.issues.join("; ")))
        }
    }

    fn check_association(&mut self, id: &LogicalId, assoc: &TagAssociation) {
        let Some(tag) = self.decls.tag(&assoc.tag_key) else {
            self.issues.push(format!(
                "`{id}` associates undeclared tag `{}`",
                assoc.tag_key
            ));
            return;
        };
        for value in &assoc.tag_values {
            if !tag.allows(value) {
                self.issues.push(format!(
                    "`{id}` associates value `{value}` which tag `{}` does not define",
                    tag.key
                ));
            }
        }
    }

    fn check_expression(
        &mut self,
        id: &LogicalId,
        resource_type: TagResourceType,
        tag_key: &str,
        tag_values: &BTreeSet<String>,
    ) {
        let Some(tag) = self.decls.tag(tag_key) else {
            self.issues
                .push(format!("`{id}` targets undeclared tag `{tag_key}`"));
            return;
        };
        for value in tag_values {
            if !tag.allows(value) {
                self.issues.push(format!(
                    "`{id}` targets value `{value}` which tag `{tag_key}` does not define"
                ));
            }
        }

        let associated = self.decls.operations().any(|(_, op)| {
            matches!(op, Operation::AssociateTag(assoc)
                if assoc.matches_expression(resource_type, tag_key, tag_values))
        });
        if !associated {
            self.issues.push(format!(
                "`{id}` targets tag `{tag_key}` on {} resources but no such resource is associated with it",
                resource_type.as_str()
            ));
        }
    }

    fn check_known(&mut self, id: &LogicalId, other: &LogicalId) {
        if self.decls.resolve(id).is_none() {
            self.issues.push(format!(
                "ordering constraint between `{id}` and `{other}` names unknown operation `{id}`"
            ));
        }
    }
}

/// Convenience wrapper around [`Validator`]
pub fn validate(decls: &DeclarationSet) -> Result<()> {
    Validator::new(decls).validate()
}
