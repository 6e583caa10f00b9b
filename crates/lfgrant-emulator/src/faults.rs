//! Scripted failures for exercising retry and skip paths

use lfgrant_core::{OperationKind, ServiceError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Fault {
    error: ServiceError,
    remaining: usize,
}

/// Failures keyed by operation kind and subject, each consumed per call
#[derive(Debug, Default)]
pub struct FaultPlan {
    faults: HashMap<(OperationKind, String), Fault>,
}

impl FaultPlan {
    /// Fail the next `times` calls of `kind` on `subject` with `error`
    pub fn inject(
        &mut self,
        kind: OperationKind,
        subject: impl Into<String>,
        error: ServiceError,
        times: usize,
    ) {
        self.faults
            .insert((kind, subject.into()), Fault { error, remaining: times });
    }

    /// Consume one failure for this call, if any is scripted
    pub fn take(&mut self, kind: OperationKind, subject: &str) -> Option<ServiceError> {
        let key = (kind, subject.to_string());
        let fault = self.faults.get_mut(&key)?;
        if fault.remaining == 0 {
            return None;
        }
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(&key);
        }
        Some(error)
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }
}
