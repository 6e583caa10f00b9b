//! Topological executor
//!
//! A single coordinator owns the node-state table and hands ready nodes to a
//! bounded set of tokio tasks. Each task performs one operation's external
//! call (retries included) and reports back; only the coordinator moves a
//! node between states, so no two workers ever act on the same node.

use crate::backend::{apply_operation, ApplyOutcome, CatalogService, ServiceError};
use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind};
use crate::operation::{LogicalId, Operation};
use crate::plan::ExecutionPlan;
use crate::report::{NodeError, NodeOutcome, NodeReport, NodeState, RunReport};
use crate::retry::{with_retry_if, RetryConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Tuning for one executor
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum external calls in flight
    pub jobs: usize,
    pub retry: RetryConfig,
    /// Bound on a single attempt; expiry counts as a transient failure
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Progress callbacks, invoked from the coordinator
pub trait ExecutionObserver: Send + Sync {
    /// Called right before a node's external call is issued
    fn on_node_start(&self, id: &LogicalId, operation: &Operation);

    /// Called once per node with its terminal record
    fn on_node_finish(&self, report: &NodeReport);
}

/// Observer that ignores every event
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_node_start(&self, _id: &LogicalId, _operation: &Operation) {}
    fn on_node_finish(&self, _report: &NodeReport) {}
}

/// Operations this executor has applied successfully
#[derive(Debug, Default)]
pub struct ApplyLedger {
    applied: Mutex<HashMap<LogicalId, Operation>>,
}

enum LedgerCheck {
    Absent,
    Applied,
    Differs(Operation),
}

impl ApplyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn check(&self, id: &LogicalId, operation: &Operation) -> LedgerCheck {
        match self.applied.lock().await.get(id) {
            None => LedgerCheck::Absent,
            Some(applied) if applied == operation => LedgerCheck::Applied,
            Some(applied) => LedgerCheck::Differs(applied.clone()),
        }
    }

    async fn record(&self, id: LogicalId, operation: Operation) {
        self.applied.lock().await.insert(id, operation);
    }
}

struct Attempted {
    node: usize,
    result: Result<ApplyOutcome, ServiceError>,
    attempts: u32,
}

/// Applies execution plans against a [`CatalogService`]
pub struct Executor {
    service: Arc<dyn CatalogService>,
    config: ExecutorConfig,
    ledger: ApplyLedger,
    observer: Arc<dyn ExecutionObserver>,
}

impl Executor {
    pub fn new(service: Arc<dyn CatalogService>, config: ExecutorConfig) -> Self {
        Self {
            service,
            config,
            ledger: ApplyLedger::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Apply every node of `plan`. Always returns a report covering every
    /// node; failures are node-scoped and recorded in it.
    pub async fn run(&self, plan: &ExecutionPlan, cancel: &CancelToken) -> RunReport {
        let mut run = Run::new(plan);
        let jobs = self.config.jobs.max(1);
        let mut tasks: JoinSet<Attempted> = JoinSet::new();
        let mut cancelled = false;

        tracing::info!(
            catalog = plan.catalog_id(),
            operations = plan.len(),
            jobs,
            "applying plan"
        );

        loop {
            if !cancelled && cancel.is_cancelled() {
                tracing::warn!("run cancelled, no further operations will start");
                cancelled = true;
            }

            while !cancelled && tasks.len() < jobs {
                let Some(node) = run.pop_ready() else { break };
                self.start(&mut run, node, &mut tasks).await;
            }

            if tasks.is_empty() {
                if cancelled || !run.has_ready() {
                    break;
                }
                continue;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(attempted)) => self.finish(&mut run, attempted).await,
                    Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Some(Err(e)) => tracing::error!(error = %e, "apply task aborted"),
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {
                    tracing::warn!("run cancelled, waiting for running operations");
                    cancelled = true;
                }
            }
        }

        run.close(cancelled, self.observer.as_ref());
        let report = run.into_report(plan.catalog_id(), cancelled);
        tracing::info!(
            succeeded = report.count(NodeState::Succeeded),
            failed = report.count(NodeState::Failed),
            skipped = report.count(NodeState::Skipped),
            "apply finished"
        );
        report
    }

    /// Move a ready node to running, short-circuiting through the ledger
    async fn start(&self, run: &mut Run<'_>, node: usize, tasks: &mut JoinSet<Attempted>) {
        let plan = run.plan;
        let planned = plan.graph().node(node);
        let id = planned.id.clone();

        match self.ledger.check(&id, &planned.operation).await {
            LedgerCheck::Applied => {
                tracing::debug!(%id, "already applied by this executor");
                run.succeed(node, NodeOutcome::Unchanged, 0, self.observer.as_ref());
                return;
            }
            LedgerCheck::Differs(applied) => {
                let err = Error::conflict(
                    &id,
                    format!("applied earlier as {applied}, now declared as {}", planned.operation),
                );
                run.fail(node, &err, 0, self.observer.as_ref());
                return;
            }
            LedgerCheck::Absent => {}
        }

        run.set_state(node, NodeState::Running);
        self.observer.on_node_start(&id, &planned.operation);

        let service = self.service.clone();
        let retry = self.config.retry.clone();
        let call_timeout = self.config.call_timeout;
        let catalog_id: Arc<str> = Arc::from(plan.catalog_id());
        let operation = Arc::new(planned.operation.clone());
        let span = tracing::info_span!("apply", id = %id, kind = %operation.kind());

        tasks.spawn(
            async move {
                let (result, attempts) = with_retry_if(
                    &retry,
                    |attempt| {
                        let service = service.clone();
                        let catalog_id = catalog_id.clone();
                        let operation = operation.clone();
                        async move {
                            tracing::debug!(attempt, "calling catalog service");
                            let call =
                                apply_operation(service.as_ref(), &catalog_id, &operation);
                            match tokio::time::timeout(call_timeout, call).await {
                                Ok(result) => result,
                                Err(_) => Err(ServiceError::transient(format!(
                                    "call timed out after {call_timeout:?}"
                                ))),
                            }
                        }
                    },
                    ServiceError::is_transient,
                )
                .await;
                Attempted {
                    node,
                    result,
                    attempts,
                }
            }
            .instrument(span),
        );
    }

    async fn finish(&self, run: &mut Run<'_>, attempted: Attempted) {
        let Attempted {
            node,
            result,
            attempts,
        } = attempted;
        match result {
            Ok(outcome) => {
                let plan = run.plan;
                let planned = plan.graph().node(node);
                self.ledger
                    .record(planned.id.clone(), planned.operation.clone())
                    .await;
                run.succeed(node, outcome.into(), attempts, self.observer.as_ref());
            }
            Err(err) => {
                run.fail(node, &Error::from(err), attempts, self.observer.as_ref());
            }
        }
    }
}

/// Node-state table of one run
struct Run<'p> {
    plan: &'p ExecutionPlan,
    /// rank of each node in the topological order
    rank: Vec<usize>,
    reports: Vec<NodeReport>,
    waiting_on: Vec<usize>,
    ready: BTreeSet<(usize, usize)>,
}

impl<'p> Run<'p> {
    fn new(plan: &'p ExecutionPlan) -> Self {
        let graph = plan.graph();
        let mut rank = vec![0; graph.len()];
        for (position, node) in graph.topological_order().into_iter().enumerate() {
            rank[node] = position;
        }

        let reports = graph
            .nodes()
            .iter()
            .map(|planned| NodeReport {
                id: planned.id.clone(),
                kind: planned.operation.kind(),
                subject: planned.operation.subject(),
                state: NodeState::Pending,
                attempts: 0,
                outcome: None,
                error: None,
            })
            .collect();
        let waiting_on: Vec<usize> = (0..graph.len())
            .map(|n| graph.predecessors(n).count())
            .collect();

        let mut run = Self {
            plan,
            rank,
            reports,
            waiting_on,
            ready: BTreeSet::new(),
        };
        for node in 0..graph.len() {
            if run.waiting_on[node] == 0 {
                run.mark_ready(node);
            }
        }
        run
    }

    fn mark_ready(&mut self, node: usize) {
        self.set_state(node, NodeState::Ready);
        self.ready.insert((self.rank[node], node));
    }

    fn pop_ready(&mut self) -> Option<usize> {
        self.ready.pop_first().map(|(_, node)| node)
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn set_state(&mut self, node: usize, state: NodeState) {
        self.reports[node].state = state;
    }

    fn succeed(
        &mut self,
        node: usize,
        outcome: NodeOutcome,
        attempts: u32,
        observer: &dyn ExecutionObserver,
    ) {
        let report = &mut self.reports[node];
        report.state = NodeState::Succeeded;
        report.outcome = Some(outcome);
        report.attempts = attempts;
        tracing::info!(id = %report.id, ?outcome, attempts, "operation succeeded");
        observer.on_node_finish(report);

        let successors: Vec<usize> = self.plan.graph().successors(node).collect();
        for succ in successors {
            self.waiting_on[succ] -= 1;
            if self.waiting_on[succ] == 0 && self.reports[succ].state == NodeState::Pending {
                self.mark_ready(succ);
            }
        }
    }

    fn fail(&mut self, node: usize, err: &Error, attempts: u32, observer: &dyn ExecutionObserver) {
        let report = &mut self.reports[node];
        report.state = NodeState::Failed;
        report.attempts = attempts;
        report.error = Some(NodeError {
            kind: err.kind(),
            message: err.to_string(),
        });
        tracing::error!(id = %report.id, error = %err, attempts, "operation failed");
        observer.on_node_finish(report);

        let failed = report.id.clone();
        let skipped = Error::DependencyFailure {
            failed: failed.clone(),
        };
        for desc in self.plan.graph().descendants(node) {
            let report = &mut self.reports[desc];
            if report.state.is_terminal() {
                continue;
            }
            self.ready.remove(&(self.rank[desc], desc));
            report.state = NodeState::Skipped;
            report.error = Some(NodeError {
                kind: skipped.kind(),
                message: skipped.to_string(),
            });
            tracing::warn!(id = %report.id, %failed, "skipping dependent operation");
            observer.on_node_finish(report);
        }
    }

    /// Settle every node that never reached a terminal state
    fn close(&mut self, cancelled: bool, observer: &dyn ExecutionObserver) {
        for report in &mut self.reports {
            if report.state.is_terminal() {
                continue;
            }
            let (state, kind, message) = if cancelled {
                (
                    NodeState::Skipped,
                    ErrorKind::Cancelled,
                    "run cancelled before the operation started",
                )
            } else {
                (
                    NodeState::Failed,
                    ErrorKind::ExternalService,
                    "apply task ended without reporting an outcome",
                )
            };
            report.state = state;
            report.error = Some(NodeError {
                kind,
                message: message.to_string(),
            });
            observer.on_node_finish(report);
        }
        self.ready.clear();
    }

    fn into_report(self, catalog_id: &str, cancelled: bool) -> RunReport {
        let mut nodes: Vec<Option<NodeReport>> = self.reports.into_iter().map(Some).collect();
        let ordered = self
            .plan
            .graph()
            .topological_order()
            .into_iter()
            .filter_map(|n| nodes[n].take())
            .collect();
        RunReport {
            catalog_id: catalog_id.to_string(),
            cancelled,
            nodes: ordered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarations::DeclarationSet;
    use crate::plan::plan;
    use crate::types::{
        permission_set, DataLocationRegistration, PermissionGrant, Principal, Resource, Tag,
        TagAssociation, TagResourceType,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records calls and replays scripted failures per subject
    #[derive(Default)]
    struct MockService {
        log: StdMutex<Vec<String>>,
        script: StdMutex<HashMap<String, VecDeque<ServiceError>>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockService {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn fail(&self, subject: &str, errors: Vec<ServiceError>) {
            self.script
                .lock()
                .unwrap()
                .insert(subject.to_string(), errors.into());
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        async fn call(&self, subject: String) -> Result<ApplyOutcome, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("start {subject}"));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(&subject)
                .and_then(VecDeque::pop_front);
            self.log.lock().unwrap().push(format!("end {subject}"));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match scripted {
                Some(err) => Err(err),
                None => Ok(ApplyOutcome::Created),
            }
        }
    }

    #[async_trait]
    impl CatalogService for MockService {
        async fn register_resource(
            &self,
            _catalog_id: &str,
            registration: &DataLocationRegistration,
        ) -> Result<ApplyOutcome, ServiceError> {
            self.call(registration.arn.clone()).await
        }

        async fn create_tag(
            &self,
            _catalog_id: &str,
            tag: &Tag,
        ) -> Result<ApplyOutcome, ServiceError> {
            self.call(tag.key.clone()).await
        }

        async fn associate_tag(
            &self,
            _catalog_id: &str,
            association: &TagAssociation,
        ) -> Result<ApplyOutcome, ServiceError> {
            self.call(format!("assoc {}", association.tag_key)).await
        }

        async fn grant(
            &self,
            _catalog_id: &str,
            grant: &PermissionGrant,
        ) -> Result<ApplyOutcome, ServiceError> {
            self.call(grant.principal.identifier.clone()).await
        }
    }

    /// Cancels the run as soon as the first node finishes
    struct CancelAfterFirst(CancelToken);

    impl ExecutionObserver for CancelAfterFirst {
        fn on_node_start(&self, _id: &LogicalId, _operation: &Operation) {}
        fn on_node_finish(&self, _report: &NodeReport) {
            self.0.cancel();
        }
    }

    fn quick_config(jobs: usize, max_attempts: u32) -> ExecutorConfig {
        ExecutorConfig {
            jobs,
            retry: RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                exponential_base: 2.0,
            },
            call_timeout: Duration::from_secs(5),
        }
    }

    fn privacy_decls() -> DeclarationSet {
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .declare_tag("privacy_tag", Tag::new("privacy", ["open"]).unwrap())
            .unwrap();
        decls
            .associate_tag(
                "assoc_privacy",
                TagAssociation::new(
                    "privacy",
                    ["open"],
                    Resource::table_with_columns(
                        "default",
                        "reviews",
                        ["product_id", "product_title"],
                    )
                    .unwrap(),
                )
                .unwrap(),
            )
            .unwrap();
        decls
            .submit_grant(
                "grant_ds",
                Principal::user("ds-1").unwrap(),
                Resource::tag_expression(TagResourceType::Table, "privacy", ["open"]).unwrap(),
                permission_set(["SELECT"]).unwrap(),
                permission_set(["SELECT"]).unwrap(),
            )
            .unwrap();
        decls
            .declare_tag("env_tag", Tag::new("environment", ["production"]).unwrap())
            .unwrap();
        decls
    }

    fn state_of(report: &RunReport, id: &str) -> NodeState {
        report.node(&LogicalId::from(id)).unwrap().state
    }

    #[tokio::test]
    async fn test_dependencies_finish_before_dependents_start() {
        let service = Arc::new(MockService::with_delay(Duration::from_millis(5)));
        let executor = Executor::new(service.clone(), quick_config(4, 1));
        let plan = plan(&privacy_decls()).unwrap();

        let report = executor.run(&plan, &CancelToken::new()).await;
        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);

        let log = service.log();
        let pos = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(pos("end privacy") < pos("start assoc privacy"));
        assert!(pos("end assoc privacy") < pos("start ds-1"));
    }

    #[tokio::test]
    async fn test_failure_skips_descendants_only() {
        let service = Arc::new(MockService::default());
        service.fail("privacy", vec![ServiceError::terminal("InvalidInputException")]);
        let executor = Executor::new(service.clone(), quick_config(2, 3));
        let plan = plan(&privacy_decls()).unwrap();

        let report = executor.run(&plan, &CancelToken::new()).await;
        assert_eq!(state_of(&report, "privacy_tag"), NodeState::Failed);
        assert_eq!(state_of(&report, "assoc_privacy"), NodeState::Skipped);
        assert_eq!(state_of(&report, "grant_ds"), NodeState::Skipped);
        assert_eq!(state_of(&report, "env_tag"), NodeState::Succeeded);
        assert_eq!(report.exit_code(), 2);

        let grant = report.node(&LogicalId::from("grant_ds")).unwrap();
        assert_eq!(grant.attempts, 0);
        assert_eq!(grant.error.as_ref().unwrap().kind, ErrorKind::DependencyFailure);
        let failed = report.node(&LogicalId::from("privacy_tag")).unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(!service.log().iter().any(|e| e.contains("ds-1")));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let service = Arc::new(MockService::default());
        service.fail(
            "privacy",
            vec![
                ServiceError::transient("ThrottlingException"),
                ServiceError::transient("ThrottlingException"),
            ],
        );
        let executor = Executor::new(service, quick_config(1, 3));
        let report = executor
            .run(&plan(&privacy_decls()).unwrap(), &CancelToken::new())
            .await;

        assert!(report.succeeded());
        assert_eq!(report.node(&LogicalId::from("privacy_tag")).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let service = Arc::new(MockService::with_delay(Duration::from_millis(200)));
        let mut config = quick_config(1, 2);
        config.call_timeout = Duration::from_millis(10);
        let mut decls = DeclarationSet::new("123456789012");
        decls
            .declare_tag("env", Tag::new("environment", ["production"]).unwrap())
            .unwrap();

        let report = Executor::new(service, config)
            .run(&plan(&decls).unwrap(), &CancelToken::new())
            .await;
        let node = report.node(&LogicalId::from("env")).unwrap();
        assert_eq!(node.state, NodeState::Failed);
        assert_eq!(node.attempts, 2);
        assert!(node.error.as_ref().unwrap().message.contains("transient"));
    }

    #[tokio::test]
    async fn test_ledger_makes_reapply_a_no_op() {
        let service = Arc::new(MockService::default());
        let executor = Executor::new(service.clone(), quick_config(2, 1));
        let plan = plan(&privacy_decls()).unwrap();

        assert!(executor.run(&plan, &CancelToken::new()).await.succeeded());
        let calls = service.log().len();

        let second = executor.run(&plan, &CancelToken::new()).await;
        assert!(second.succeeded());
        assert_eq!(service.log().len(), calls);
        assert!(second
            .nodes
            .iter()
            .all(|n| n.outcome == Some(NodeOutcome::Unchanged) && n.attempts == 0));
    }

    #[tokio::test]
    async fn test_ledger_detects_changed_payload() {
        let service = Arc::new(MockService::default());
        let executor = Executor::new(service, quick_config(1, 1));
        executor
            .run(&plan(&privacy_decls()).unwrap(), &CancelToken::new())
            .await;

        let mut changed = DeclarationSet::new("123456789012");
        changed
            .declare_tag("privacy_tag", Tag::new("privacy", ["open", "closed"]).unwrap())
            .unwrap();
        let report = executor
            .run(&plan(&changed).unwrap(), &CancelToken::new())
            .await;
        let node = report.node(&LogicalId::from("privacy_tag")).unwrap();
        assert_eq!(node.state, NodeState::Failed);
        assert_eq!(node.error.as_ref().unwrap().kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let service = Arc::new(MockService::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = Executor::new(service.clone(), quick_config(2, 1))
            .run(&plan(&privacy_decls()).unwrap(), &cancel)
            .await;

        assert!(report.cancelled);
        assert!(service.log().is_empty());
        assert!(report.nodes.iter().all(|n| n.state == NodeState::Skipped
            && n.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_mid_run_lets_running_node_finish() {
        let service = Arc::new(MockService::default());
        let cancel = CancelToken::new();
        let executor = Executor::new(service, quick_config(1, 1))
            .with_observer(Arc::new(CancelAfterFirst(cancel.clone())));

        let report = executor.run(&plan(&privacy_decls()).unwrap(), &cancel).await;
        assert_eq!(report.count(NodeState::Succeeded), 1);
        assert_eq!(report.count(NodeState::Skipped), 3);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_jobs_bound_concurrency() {
        let service = Arc::new(MockService::with_delay(Duration::from_millis(10)));
        let mut decls = DeclarationSet::new("123456789012");
        for i in 0..6 {
            decls
                .declare_tag(format!("tag_{i}"), Tag::new(format!("key{i}"), ["v"]).unwrap())
                .unwrap();
        }
        let report = Executor::new(service.clone(), quick_config(2, 1))
            .run(&plan(&decls).unwrap(), &CancelToken::new())
            .await;

        assert!(report.succeeded());
        assert!(service.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(service.log().len(), 12);
    }
}
