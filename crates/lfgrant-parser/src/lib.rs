//! lfgrant declaration parser
//!
//! Parses declaration files into [`Statement`]s and loads them into a
//! [`DeclarationSet`].

use anyhow::{anyhow, Context, Result};
use lfgrant_core::{
    permission_set, DataLocationRegistration, DeclarationSet, LogicalId, Principal,
    PrincipalKind, Resource, Tag, TagAssociation, TagResourceType,
};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::BTreeSet;

#[derive(Parser)]
#[grammar = "grammar.pest"]
pub struct DeclarationParser;

/// Which granted permissions the principal may pass on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOption {
    None,
    /// Bare `WITH GRANT OPTION`: every granted permission
    All,
    Only(Vec<String>),
}

/// One parsed declaration
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Catalog {
        catalog_id: String,
    },
    RegisterLocation {
        id: String,
        arn: String,
        role_arn: Option<String>,
    },
    CreateTag {
        id: String,
        key: String,
        values: Vec<String>,
    },
    AssociateTag {
        id: String,
        key: String,
        values: Vec<String>,
        resource: Resource,
    },
    Grant {
        id: String,
        permissions: Vec<String>,
        resource: Resource,
        principal: Principal,
        grant_option: GrantOption,
    },
    Principal {
        principal: Principal,
        created_by: String,
    },
    DependsOn {
        after: String,
        before: String,
    },
}

/// A statement with the line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub line: usize,
    pub statement: Statement,
}

/// Parse declaration source into statements
pub fn parse_declarations(source: &str) -> Result<Vec<Located>> {
    let pairs = DeclarationParser::parse(Rule::program, source)
        .map_err(|e| anyhow!("Parse error: {}", e))?;

    let mut statements = Vec::new();
    for pair in pairs {
        if pair.as_rule() != Rule::program {
            continue;
        }
        for inner in pair.into_inner() {
            if inner.as_rule() == Rule::EOI {
                continue;
            }
            let line = inner.line_col().0;
            let statement =
                parse_statement(inner).with_context(|| format!("in statement at line {line}"))?;
            statements.push(Located { line, statement });
        }
    }
    Ok(statements)
}

/// Parse `source` and load every statement into a fresh [`DeclarationSet`]
pub fn load_declarations(source: &str) -> Result<DeclarationSet> {
    let mut decls = DeclarationSet::default();
    let mut catalog: Option<String> = None;

    for Located { line, statement } in parse_declarations(source)? {
        apply_statement(&mut decls, &mut catalog, statement)
            .with_context(|| format!("in statement at line {line}"))?;
    }

    tracing::debug!(operations = decls.len(), "declarations loaded");
    Ok(decls)
}

fn apply_statement(
    decls: &mut DeclarationSet,
    catalog: &mut Option<String>,
    statement: Statement,
) -> Result<()> {
    match statement {
        Statement::Catalog { catalog_id } => {
            if let Some(existing) = catalog.as_deref() {
                if existing != catalog_id {
                    return Err(anyhow!(
                        "catalog already set to '{}', cannot change it to '{}'",
                        existing,
                        catalog_id
                    ));
                }
            }
            decls.set_catalog_id(catalog_id.clone());
            *catalog = Some(catalog_id);
        }
        Statement::RegisterLocation { id, arn, role_arn } => {
            let registration = match role_arn {
                Some(role) => DataLocationRegistration::with_role(arn, role)?,
                None => DataLocationRegistration::service_linked(arn)?,
            };
            decls.register_location(id, registration)?;
        }
        Statement::CreateTag { id, key, values } => {
            decls.declare_tag(id, Tag::new(key, values)?)?;
        }
        Statement::AssociateTag {
            id,
            key,
            values,
            resource,
        } => {
            decls.associate_tag(id, TagAssociation::new(key, values, resource)?)?;
        }
        Statement::Grant {
            id,
            permissions,
            resource,
            principal,
            grant_option,
        } => {
            let permissions = permission_set(&permissions)?;
            let grantable = match grant_option {
                GrantOption::None => BTreeSet::new(),
                GrantOption::All => permissions.clone(),
                GrantOption::Only(names) => permission_set(&names)?,
            };
            decls.submit_grant(id, principal, resource, permissions, grantable)?;
        }
        Statement::Principal {
            principal,
            created_by,
        } => {
            decls.declare_principal(principal, LogicalId::from(created_by))?;
        }
        Statement::DependsOn { after, before } => {
            decls.add_dependency(after, before);
        }
    }
    Ok(())
}

fn parse_statement(pair: Pair<Rule>) -> Result<Statement> {
    match pair.as_rule() {
        Rule::catalog_statement => Ok(Statement::Catalog {
            catalog_id: first_string(pair)?,
        }),
        Rule::register_statement => parse_register_statement(pair),
        Rule::create_tag_statement => parse_create_tag_statement(pair),
        Rule::associate_statement => parse_associate_statement(pair),
        Rule::grant_statement => parse_grant_statement(pair),
        Rule::principal_statement => parse_principal_statement(pair),
        Rule::depends_statement => parse_depends_statement(pair),
        other => Err(anyhow!("Unexpected statement: {:?}", other)),
    }
}

fn parse_register_statement(pair: Pair<Rule>) -> Result<Statement> {
    let mut arn = None;
    let mut role_arn = None;
    let mut id = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::string_literal => arn = Some(string_value(inner)),
            Rule::with_role => role_arn = Some(first_string(inner)?),
            Rule::alias => id = Some(alias_value(inner)?),
            _ => {}
        }
    }

    Ok(Statement::RegisterLocation {
        id: id.ok_or_else(|| anyhow!("Missing AS <id> in REGISTER LOCATION"))?,
        arn: arn.ok_or_else(|| anyhow!("Missing location in REGISTER LOCATION"))?,
        role_arn,
    })
}

fn parse_create_tag_statement(pair: Pair<Rule>) -> Result<Statement> {
    let mut key = None;
    let mut values = Vec::new();
    let mut id = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier => key = Some(inner.as_str().to_string()),
            Rule::string_list => values = parse_string_list(inner),
            Rule::alias => id = Some(alias_value(inner)?),
            _ => {}
        }
    }

    Ok(Statement::CreateTag {
        id: id.ok_or_else(|| anyhow!("Missing AS <id> in CREATE TAG"))?,
        key: key.ok_or_else(|| anyhow!("Missing tag key in CREATE TAG"))?,
        values,
    })
}

fn parse_associate_statement(pair: Pair<Rule>) -> Result<Statement> {
    let mut key = None;
    let mut values = Vec::new();
    let mut resource = None;
    let mut id = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier => key = Some(inner.as_str().to_string()),
            Rule::string_list => values = parse_string_list(inner),
            Rule::resource => resource = Some(parse_resource(inner)?),
            Rule::alias => id = Some(alias_value(inner)?),
            _ => {}
        }
    }

    Ok(Statement::AssociateTag {
        id: id.ok_or_else(|| anyhow!("Missing AS <id> in ASSOCIATE TAG"))?,
        key: key.ok_or_else(|| anyhow!("Missing tag key in ASSOCIATE TAG"))?,
        values,
        resource: resource.ok_or_else(|| anyhow!("Missing resource in ASSOCIATE TAG"))?,
    })
}

fn parse_grant_statement(pair: Pair<Rule>) -> Result<Statement> {
    let mut permissions = Vec::new();
    let mut resource = None;
    let mut principal = None;
    let mut grant_option = GrantOption::None;
    let mut id = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::permission_list => permissions = parse_permission_list(inner),
            Rule::resource => resource = Some(parse_resource(inner)?),
            Rule::principal => principal = Some(parse_principal(inner)?),
            Rule::grant_option => {
                grant_option = match inner.into_inner().next() {
                    Some(list) => GrantOption::Only(parse_permission_list(list)),
                    None => GrantOption::All,
                };
            }
            Rule::alias => id = Some(alias_value(inner)?),
            _ => {}
        }
    }

    Ok(Statement::Grant {
        id: id.ok_or_else(|| anyhow!("Missing AS <id> in GRANT"))?,
        permissions,
        resource: resource.ok_or_else(|| anyhow!("Missing resource in GRANT"))?,
        principal: principal.ok_or_else(|| anyhow!("Missing principal in GRANT"))?,
        grant_option,
    })
}

fn parse_principal_statement(pair: Pair<Rule>) -> Result<Statement> {
    let mut principal = None;
    let mut created_by = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::principal => principal = Some(parse_principal(inner)?),
            Rule::identifier => created_by = Some(inner.as_str().to_string()),
            _ => {}
        }
    }

    Ok(Statement::Principal {
        principal: principal.ok_or_else(|| anyhow!("Missing principal in PRINCIPAL"))?,
        created_by: created_by.ok_or_else(|| anyhow!("Missing CREATED BY in PRINCIPAL"))?,
    })
}

fn parse_depends_statement(pair: Pair<Rule>) -> Result<Statement> {
    let ids: Vec<String> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::identifier)
        .map(|p| p.as_str().to_string())
        .collect();

    match <[String; 2]>::try_from(ids) {
        Ok([after, before]) => Ok(Statement::DependsOn { after, before }),
        Err(_) => Err(anyhow!("DEPENDS ON needs exactly two identifiers")),
    }
}

/// Parse a principal such as `ROLE 'arn:aws:iam::1:role/etl'`
pub fn parse_principal_spec(spec: &str) -> Result<Principal> {
    let mut pairs = DeclarationParser::parse(Rule::principal, spec.trim())
        .map_err(|e| anyhow!("Parse error: {}", e))?;
    let pair = pairs.next().ok_or_else(|| anyhow!("Empty principal"))?;
    if pair.as_str().len() != spec.trim().len() {
        return Err(anyhow!("Trailing input after principal: {}", spec));
    }
    parse_principal(pair)
}

/// Parse a resource such as `TABLE default.reviews COLUMNS (product_id)`
pub fn parse_resource_spec(spec: &str) -> Result<Resource> {
    let mut pairs = DeclarationParser::parse(Rule::resource, spec.trim())
        .map_err(|e| anyhow!("Parse error: {}", e))?;
    let pair = pairs.next().ok_or_else(|| anyhow!("Empty resource"))?;
    if pair.as_str().len() != spec.trim().len() {
        return Err(anyhow!("Trailing input after resource: {}", spec));
    }
    parse_resource(pair)
}

fn parse_principal(pair: Pair<Rule>) -> Result<Principal> {
    let mut kind = None;
    let mut identifier = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::principal_kind => {
                kind = Some(match inner.as_str().to_ascii_uppercase().as_str() {
                    "USER" => PrincipalKind::User,
                    "ROLE" => PrincipalKind::Role,
                    "GROUP" => PrincipalKind::Group,
                    other => return Err(anyhow!("Unknown principal kind: {}", other)),
                })
            }
            Rule::string_literal => identifier = Some(string_value(inner)),
            _ => {}
        }
    }

    Ok(Principal::new(
        kind.ok_or_else(|| anyhow!("Missing principal kind"))?,
        identifier.ok_or_else(|| anyhow!("Missing principal identifier"))?,
    )?)
}

fn parse_resource(pair: Pair<Rule>) -> Result<Resource> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| anyhow!("Empty resource"))?;

    match inner.as_rule() {
        Rule::database_resource => Ok(Resource::database(first_identifier(inner)?)?),
        Rule::location_resource => Ok(Resource::data_location(first_string(inner)?)?),
        Rule::table_resource => parse_table_resource(inner),
        Rule::tagged_resource => parse_tagged_resource(inner),
        other => Err(anyhow!("Unknown resource type: {:?}", other)),
    }
}

fn parse_table_resource(pair: Pair<Rule>) -> Result<Resource> {
    let mut database = None;
    let mut table = None;
    let mut wildcard = false;
    let mut columns = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier if database.is_none() => database = Some(inner.as_str().to_string()),
            Rule::identifier => table = Some(inner.as_str().to_string()),
            Rule::wildcard => wildcard = true,
            Rule::column_list => {
                columns = Some(
                    inner
                        .into_inner()
                        .map(|c| c.as_str().to_string())
                        .collect::<Vec<_>>(),
                )
            }
            _ => {}
        }
    }

    let database = database.ok_or_else(|| anyhow!("Missing database name"))?;
    let resource = match (table, wildcard, columns) {
        (None, true, None) => Resource::table_wildcard(database)?,
        (None, true, Some(_)) => return Err(anyhow!("COLUMNS cannot follow a table wildcard")),
        (Some(table), false, None) => Resource::table(database, table)?,
        (Some(table), false, Some(columns)) => {
            Resource::table_with_columns(database, table, columns)?
        }
        _ => return Err(anyhow!("Missing table name")),
    };
    Ok(resource)
}

fn parse_tagged_resource(pair: Pair<Rule>) -> Result<Resource> {
    let mut resource_type = None;
    let mut key = None;
    let mut values = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::tag_resource_type => {
                resource_type = Some(inner.as_str().parse::<TagResourceType>()?)
            }
            Rule::identifier => key = Some(inner.as_str().to_string()),
            Rule::string_list => values = parse_string_list(inner),
            _ => {}
        }
    }

    Ok(Resource::tag_expression(
        resource_type.ok_or_else(|| anyhow!("Missing resource type in TAGGED"))?,
        key.ok_or_else(|| anyhow!("Missing tag key in TAGGED"))?,
        values,
    )?)
}

// Helper parsing functions
fn parse_permission_list(pair: Pair<Rule>) -> Vec<String> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::permission)
        .map(|p| p.as_str().to_string())
        .collect()
}

fn parse_string_list(pair: Pair<Rule>) -> Vec<String> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::string_literal)
        .map(string_value)
        .collect()
}

fn string_value(pair: Pair<Rule>) -> String {
    pair.as_str().trim_matches('\'').to_string()
}

fn first_string(pair: Pair<Rule>) -> Result<String> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::string_literal)
        .map(string_value)
        .ok_or_else(|| anyhow!("Missing quoted string"))
}

fn first_identifier(pair: Pair<Rule>) -> Result<String> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::identifier)
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| anyhow!("Missing identifier"))
}

fn alias_value(pair: Pair<Rule>) -> Result<String> {
    first_identifier(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfgrant_core::{Error, Operation, TableName};

    const PRIVACY: &str = "
        -- tag-based access for the data science team
        CATALOG '123456789012';
        CREATE TAG privacy VALUES ('open') AS privacy_tag;
        ASSOCIATE TAG privacy ('open')
            WITH TABLE default.reviews COLUMNS (product_id, product_title)
            AS assoc_privacy;
        GRANT SELECT ON TAGGED TABLE privacy IN ('open')
            TO USER 'ds-1' WITH GRANT OPTION (SELECT) AS grant_ds;
    ";

    #[test]
    fn test_privacy_declarations() {
        let decls = load_declarations(PRIVACY).unwrap();
        assert_eq!(decls.catalog_id(), "123456789012");
        assert_eq!(decls.len(), 3);

        match decls.get(&LogicalId::from("assoc_privacy")) {
            Some(Operation::AssociateTag(assoc)) => {
                assert_eq!(
                    assoc.resource,
                    Resource::table_with_columns(
                        "default",
                        "reviews",
                        ["product_id", "product_title"],
                    )
                    .unwrap()
                );
            }
            other => panic!("Expected association, got {other:?}"),
        }
        match decls.get(&LogicalId::from("grant_ds")) {
            Some(Operation::Grant(grant)) => {
                assert_eq!(grant.principal, Principal::user("ds-1").unwrap());
                assert_eq!(grant.grantable_permissions, permission_set(["SELECT"]).unwrap());
            }
            other => panic!("Expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_grant_option_makes_everything_grantable() {
        let src = "GRANT select, describe ON DATABASE default TO ROLE 'arn:aws:iam::1:role/etl' \
                   WITH GRANT OPTION AS g;";
        match &parse_declarations(src).unwrap()[0].statement {
            Statement::Grant { grant_option, permissions, .. } => {
                assert_eq!(*grant_option, GrantOption::All);
                assert_eq!(permissions, &vec!["select".to_string(), "describe".to_string()]);
            }
            other => panic!("Expected grant, got {other:?}"),
        }
        let decls = load_declarations(src).unwrap();
        let Some(Operation::Grant(grant)) = decls.get(&LogicalId::from("g")) else {
            panic!("grant missing");
        };
        assert_eq!(grant.grantable_permissions, grant.permissions);
    }

    #[test]
    fn test_resources() {
        assert_eq!(
            parse_resource_spec("TABLE sales.*").unwrap(),
            Resource::Table {
                database: "sales".to_string(),
                name: TableName::Wildcard
            }
        );
        assert_eq!(
            parse_resource_spec("LOCATION 'arn:aws:s3:::lake/raw'").unwrap(),
            Resource::data_location("arn:aws:s3:::lake/raw").unwrap()
        );
        assert_eq!(
            parse_resource_spec("tagged database environment in ('production')").unwrap(),
            Resource::tag_expression(TagResourceType::Database, "environment", ["production"])
                .unwrap()
        );
        assert!(parse_resource_spec("TABLE sales.orders extra").is_err());
        assert_eq!(
            parse_principal_spec("GROUP 'analysts'").unwrap(),
            Principal::group("analysts").unwrap()
        );
    }

    #[test]
    fn test_registration_provenance_and_edges() {
        let src = "
            REGISTER LOCATION 'arn:aws:s3:::lake' WITH ROLE 'arn:aws:iam::1:role/lf' AS register_lake;
            PRINCIPAL ROLE 'arn:aws:iam::1:role/etl' CREATED BY register_lake;
            register_lake DEPENDS ON other-op;
        ";
        let statements = parse_declarations(src).unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].line, 2);
        assert_eq!(
            statements[2].statement,
            Statement::DependsOn {
                after: "register_lake".to_string(),
                before: "other-op".to_string()
            }
        );

        let decls = load_declarations(src).unwrap();
        assert_eq!(decls.edges().len(), 1);
        assert!(decls.principal_origin("arn:aws:iam::1:role/etl").is_some());
        match decls.get(&LogicalId::from("register_lake")) {
            Some(Operation::RegisterResource(reg)) => {
                assert!(!reg.use_service_linked_role);
                assert_eq!(reg.role_arn.as_deref(), Some("arn:aws:iam::1:role/lf"));
            }
            other => panic!("Expected registration, got {other:?}"),
        }
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let src =
            "CREATE TAG privacy VALUES ('open') AS t1;\nCREATE TAG privacy VALUES ('closed') AS t2;";
        let err = load_declarations(src).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
        let core = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(core, Error::Validation { .. }));

        assert!(parse_declarations("GRANT ON DATABASE d TO USER 'x' AS g;").is_err());
        assert!(load_declarations("CATALOG '1'; CATALOG '2';").is_err());
    }
}
