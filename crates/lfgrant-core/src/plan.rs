//! Planning pass: validate the frozen declarations and build the graph

use crate::declarations::DeclarationSet;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::operation::PlannedOperation;
use crate::validate::validate;
use std::fmt;

/// A validated, acyclic set of operations ready to apply
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: DependencyGraph,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn catalog_id(&self) -> &str {
        self.graph.catalog_id()
    }

    /// Operations in a valid sequential order
    pub fn order(&self) -> Vec<&PlannedOperation> {
        self.graph
            .topological_order()
            .into_iter()
            .map(|n| self.graph.node(n))
            .collect()
    }

    /// Operations grouped into waves that may run concurrently
    pub fn waves(&self) -> Vec<Vec<&PlannedOperation>> {
        self.graph
            .levels()
            .into_iter()
            .map(|wave| wave.into_iter().map(|n| self.graph.node(n)).collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "catalog {}", self.catalog_id())?;
        for (i, wave) in self.waves().iter().enumerate() {
            writeln!(f, "wave {}:", i + 1)?;
            for node in wave {
                write!(f, "  {} {}", node.id, node.operation)?;
                let deps = self.graph.dependencies_of(&node.id);
                if !deps.is_empty() {
                    let deps: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                    write!(f, " <- {}", deps.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        write!(f, "{} operations", self.len())
    }
}

/// Validate `decls` and build its dependency graph. No external calls are
/// made; any error here aborts the run before execution.
pub fn plan(decls: &DeclarationSet) -> Result<ExecutionPlan> {
    validate(decls)?;
    let graph = DependencyGraph::build(decls)?;
    tracing::info!(
        catalog = graph.catalog_id(),
        operations = graph.len(),
        waves = graph.levels().len(),
        "plan built"
    );
    Ok(ExecutionPlan { graph })
}
