//! Console progress for `apply`

use lfgrant_core::{ExecutionObserver, LogicalId, NodeReport, NodeState, Operation};

pub struct ProgressPrinter;

impl ExecutionObserver for ProgressPrinter {
    fn on_node_start(&self, id: &LogicalId, operation: &Operation) {
        println!("🔧 {id}: {operation}");
    }

    fn on_node_finish(&self, report: &NodeReport) {
        println!("{}", finish_line(report));
    }
}

fn finish_line(report: &NodeReport) -> String {
    let detail = match (&report.outcome, &report.error) {
        (Some(outcome), _) => format!("{outcome:?}"),
        (None, Some(err)) => format!("{}: {}", err.kind, err.message),
        (None, None) => String::new(),
    };
    let icon = match report.state {
        NodeState::Succeeded => "✅",
        NodeState::Failed => "❌",
        NodeState::Skipped => "⏭️ ",
        _ => "•",
    };
    match report.attempts {
        0 | 1 => format!("{icon} {}: {detail}", report.id),
        n => format!("{icon} {}: {detail} (after {n} attempts)", report.id),
    }
}
