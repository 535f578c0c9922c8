//! Parallel coordinator: bounded fan-out with join and failure policies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::step_evaluator::StepEvaluator;
use crate::domain::chain::{
    ParallelFailurePolicy, ParallelJoinPolicy, ParallelStep, ProviderRequest, StepKind,
    StepRecord, StepStatus,
};

/// Aggregate result of a parallel group
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelOutcome {
    pub success: bool,
    /// One record per sub-step, in declaration order
    pub sub_steps: Vec<StepRecord>,
    /// Response bodies of the successful sub-steps keyed by sub-step name
    pub body: Value,
    pub error: Option<String>,
}

/// Why the coordinator stopped waiting for sub-steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Settled,
    FailFast,
    AnySucceeded,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ParallelCoordinator {
    evaluator: Arc<StepEvaluator>,
}

impl ParallelCoordinator {
    pub fn new(evaluator: Arc<StepEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Run every sub-step of `group`. `requests` holds the rendered request of
    /// each sub-step in declaration order.
    pub async fn run(
        &self,
        group: &ParallelStep,
        requests: Vec<ProviderRequest>,
        cancel: CancellationToken,
    ) -> ParallelOutcome {
        let total = requests.len();
        let limit = group.max_concurrency.unwrap_or(total).clamp(1, total.max(1));
        let semaphore = Arc::new(Semaphore::new(limit));
        let started: Arc<Vec<AtomicBool>> =
            Arc::new((0..total).map(|_| AtomicBool::new(false)).collect());

        let mut records: Vec<StepRecord> = group
            .sub_steps
            .iter()
            .enumerate()
            .map(|(index, sub)| {
                StepRecord::new(&sub.name, index, StepKind::Provider)
                    .with_action(&sub.provider, &sub.action_type)
            })
            .collect();
        let mut finished = vec![false; total];

        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let evaluator = self.evaluator.clone();
            let semaphore = semaphore.clone();
            let started = started.clone();

            tasks.spawn(async move {
                // Held until the sub-step finishes; the semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                started[index].store(true, Ordering::SeqCst);
                let started_at = Utc::now();
                let outcome = evaluator.invoke(request).await;
                (index, started_at, outcome)
            });
        }

        let deadline = group
            .timeout_seconds
            .and_then(|seconds| Instant::now().checked_add(Duration::from_secs(seconds)));

        let stop = loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = wait_for(deadline) => break Stop::TimedOut,
                _ = cancel.cancelled() => break Stop::Cancelled,
            };

            let Some(joined) = joined else {
                break Stop::Settled;
            };

            let (index, started_at, outcome) = match joined {
                Ok(result) => result,
                Err(error) => {
                    warn!(error = %error, "Parallel sub-step task did not complete");
                    continue;
                }
            };

            let record = &mut records[index];
            record.started_at = started_at;
            record.attempts = outcome.attempts;
            if outcome.success {
                record.complete(outcome.body);
            } else {
                record.fail(outcome.error.unwrap_or_else(|| "unknown error".to_string()));
            }
            finished[index] = true;

            debug!(
                sub_step = %record.name,
                status = %record.status,
                "Parallel sub-step finished"
            );

            match (group.join, group.on_failure, outcome.success) {
                (ParallelJoinPolicy::Any, _, true) => break Stop::AnySucceeded,
                (ParallelJoinPolicy::All, ParallelFailurePolicy::FailFast, false) => {
                    break Stop::FailFast;
                }
                _ => {}
            }
        };

        tasks.abort_all();

        for (index, record) in records.iter_mut().enumerate() {
            if finished[index] {
                continue;
            }
            let was_started = started[index].load(Ordering::SeqCst);
            let (status, message) = match (stop, was_started) {
                (Stop::TimedOut, true) => (
                    StepStatus::Failed,
                    format!(
                        "timed out after {}s",
                        group.timeout_seconds.unwrap_or_default()
                    ),
                ),
                (Stop::TimedOut, false) => {
                    (StepStatus::Skipped, "not started before timeout".to_string())
                }
                (Stop::Settled, _) => (StepStatus::Failed, "sub-step task aborted".to_string()),
                (_, true) => (StepStatus::Cancelled, "cancelled".to_string()),
                (_, false) => (StepStatus::Skipped, "not started".to_string()),
            };
            record.finish_with(status, Some(message));
        }

        aggregate(group, stop, records)
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn aggregate(group: &ParallelStep, stop: Stop, records: Vec<StepRecord>) -> ParallelOutcome {
    let success = match (stop, group.join) {
        (Stop::Cancelled, _) => false,
        (_, ParallelJoinPolicy::Any) => records.iter().any(StepRecord::is_success),
        (_, ParallelJoinPolicy::All) => records.iter().all(StepRecord::is_success),
    };

    let body: Map<String, Value> = records
        .iter()
        .filter(|r| r.is_success())
        .map(|r| (r.name.clone(), r.response_body.clone().unwrap_or(Value::Null)))
        .collect();

    let error = (!success).then(|| {
        let failures: Vec<String> = records
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| {
                format!(
                    "sub-step '{}' failed: {}",
                    r.name,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();

        let summary = match stop {
            Stop::Cancelled => "parallel step cancelled".to_string(),
            Stop::TimedOut => format!(
                "parallel step timed out after {}s",
                group.timeout_seconds.unwrap_or_default()
            ),
            _ if group.join == ParallelJoinPolicy::Any => "no sub-step succeeded".to_string(),
            _ => "parallel step failed".to_string(),
        };

        if failures.is_empty() {
            summary
        } else {
            format!("{}: {}", summary, failures.join("; "))
        }
    });

    ParallelOutcome {
        success,
        sub_steps: records,
        body: Value::Object(body),
        error,
    }
}
