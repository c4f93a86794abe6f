//! # Fleet Executor
//!
//! Runs one async action per node with bounded parallelism and collects a
//! [`FleetReport`].
//!
//! ## Guarantees
//!
//! - At most `max_parallel` actions in flight (tokio `Semaphore`).
//! - Each action runs in its own task. An error or a panic lands in that
//!   node's result and never touches a sibling.
//! - `run_all` returns only after every launched action has finished.
//! - No retry.
//! - After [`CancelToken::cancel`], nothing new is launched; in-flight
//!   actions complete and unlaunched nodes are reported as
//!   [`NodeError::Cancelled`].
//!
//! The result map is the only shared mutable state: one insert per node
//! under a `parking_lot::Mutex`.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::model::NodeSpec;
use crate::report::{ExecutionResult, FleetReport};

/// Cooperative cancellation flag shared between the caller and executors.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded-parallel runner.
#[derive(Debug, Clone)]
pub struct FleetExecutor {
    max_parallel: usize,
    cancel: CancelToken,
}

impl FleetExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs `action` on every node and returns the results in fleet order.
    pub async fn run_all<F, Fut>(&self, operation: &str, nodes: &[NodeSpec], action: F) -> FleetReport
    where
        F: Fn(NodeSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, NodeError>> + Send + 'static,
    {
        let limit = self.max_parallel.clamp(1, nodes.len().max(1));
        info!(operation, nodes = nodes.len(), max_parallel = limit, "executor start");

        let action = Arc::new(action);
        let semaphore = Arc::new(Semaphore::new(limit));
        let results: Arc<Mutex<HashMap<String, ExecutionResult>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(nodes.len())));
        let mut launched = HashSet::with_capacity(nodes.len());
        let mut handles = Vec::with_capacity(nodes.len());

        for node in nodes {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.cancel.is_cancelled() {
                warn!(operation, "cancelled, not launching remaining nodes");
                break;
            }

            launched.insert(node.name.clone());
            let node = node.clone();
            let action = Arc::clone(&action);
            let results = Arc::clone(&results);
            let operation = operation.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let inner_node = node.clone();
                let outcome = match tokio::spawn(async move { (*action)(inner_node).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(NodeError::Panicked(panic_message(e))),
                };
                match &outcome {
                    Ok(_) => debug!(operation = %operation, node = %node.label(), "ok"),
                    Err(e) => warn!(operation = %operation, node = %node.label(), error = %e, "failed"),
                }
                results
                    .lock()
                    .insert(node.name.clone(), ExecutionResult::from_outcome(&node, outcome));
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(operation, error = %e, "executor task aborted");
            }
        }

        let mut results = results.lock();
        let ordered: Vec<ExecutionResult> = nodes
            .iter()
            .map(|node| {
                results.remove(&node.name).unwrap_or_else(|| {
                    let err = if launched.contains(&node.name) {
                        NodeError::Panicked("task aborted".to_string())
                    } else {
                        NodeError::Cancelled
                    };
                    ExecutionResult::failure(node, &err)
                })
            })
            .collect();

        let report = FleetReport::new(operation, ordered);
        info!(
            operation,
            succeeded = report.succeeded_count(),
            failed = report.len() - report.succeeded_count(),
            "executor done"
        );
        report
    }
}

/// Runs `action` on every node with at most `max_parallel` in flight.
pub async fn run_all<F, Fut>(nodes: &[NodeSpec], max_parallel: usize, action: F) -> FleetReport
where
    F: Fn(NodeSpec) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, NodeError>> + Send + 'static,
{
    FleetExecutor::new(max_parallel)
        .run_all("run", nodes, action)
        .await
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
