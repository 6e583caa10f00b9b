//! Result report of an apply run

use crate::error::ErrorKind;
use crate::operation::{LogicalId, OperationKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-node execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Pending => "Pending",
            NodeState::Ready => "Ready",
            NodeState::Running => "Running",
            NodeState::Succeeded => "Succeeded",
            NodeState::Failed => "Failed",
            NodeState::Skipped => "Skipped",
        };
        f.pad(name)
    }
}

/// How a succeeded node was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The service performed the mutation
    Created,
    /// The service already held it with identical parameters
    AlreadyPresent,
    /// Applied earlier by this executor; no call was made
    Unchanged,
}

impl From<crate::backend::ApplyOutcome> for NodeOutcome {
    fn from(outcome: crate::backend::ApplyOutcome) -> Self {
        match outcome {
            crate::backend::ApplyOutcome::Created => NodeOutcome::Created,
            crate::backend::ApplyOutcome::AlreadyPresent => NodeOutcome::AlreadyPresent,
        }
    }
}

/// Error attached to a failed or skipped node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal record of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: LogicalId,
    pub kind: OperationKind,
    pub subject: String,
    pub state: NodeState,
    /// External calls made, retries included
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<NodeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

/// Every node of a run, in plan order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub catalog_id: String,
    pub cancelled: bool,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// The run succeeds only if every node succeeded
    pub fn succeeded(&self) -> bool {
        self.nodes.iter().all(|n| n.state == NodeState::Succeeded)
    }

    /// Process exit code reflecting the worst node outcome
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            2
        }
    }

    pub fn node(&self, id: &LogicalId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{:<10} {} {}({})", node.state, node.id, node.kind, node.subject)?;
            if let Some(outcome) = node.outcome {
                write!(f, " [{outcome:?}]")?;
            }
            if let Some(err) = &node.error {
                write!(f, " {}: {}", err.kind, err.message)?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.count(NodeState::Succeeded),
            self.count(NodeState::Failed),
            self.count(NodeState::Skipped)
        )
    }
}
