//! Cancellation of executions and their descendants

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::executor::{ChainExecutor, Termination};
use crate::domain::chain::{ChainError, ChainExecution, ChainId, ProviderRequest};

/// Reason recorded on descendants cancelled along with their parent
pub const PARENT_CANCELLED_REASON: &str = "parent cancelled";

/// A caller's request to cancel one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub chain_id: ChainId,
    /// Scope the caller is allowed to see; `None` matches any
    pub namespace: Option<String>,
    pub tenant: Option<String>,
    pub reason: Option<String>,
    pub cancelled_by: Option<String>,
}

impl CancelRequest {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            namespace: None,
            tenant: None,
            reason: None,
            cancelled_by: None,
        }
    }

    pub fn with_scope(mut self, namespace: impl Into<String>, tenant: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_cancelled_by(mut self, cancelled_by: impl Into<String>) -> Self {
        self.cancelled_by = Some(cancelled_by.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CancellationHandler {
    executor: Arc<ChainExecutor>,
}

impl CancellationHandler {
    pub fn new(executor: Arc<ChainExecutor>) -> Self {
        Self { executor }
    }

    /// Cancel an active execution, cascade to its active child and send the
    /// definition's cancellation notification.
    ///
    /// Fails with `ExecutionNotFound` when the execution does not exist or
    /// lies outside the requested scope, and with `Conflict` when it is
    /// already terminal.
    #[instrument(skip(self, request), fields(chain_id = %request.chain_id))]
    pub async fn cancel(&self, request: CancelRequest) -> Result<ChainExecution, ChainError> {
        let execution = self
            .executor
            .executions()
            .get(&request.chain_id)
            .await?
            .filter(|execution| in_scope(execution, &request))
            .ok_or_else(|| ChainError::execution_not_found(request.chain_id.as_str()))?;

        if execution.is_terminal() {
            return Err(ChainError::conflict(format!(
                "Execution {} is already {}",
                execution.chain_id(),
                execution.status()
            )));
        }

        let terminated = self
            .executor
            .terminate(
                &request.chain_id,
                &Termination::Cancelled {
                    reason: request.reason.clone(),
                    cancelled_by: request.cancelled_by.clone(),
                },
            )
            .await?;

        info!(
            reason = ?request.reason,
            cancelled_by = ?request.cancelled_by,
            "Chain execution cancelled"
        );

        if let Some(child_id) = terminated.active_child {
            self.cancel_descendants(child_id, request.cancelled_by.clone())
                .await;
        }

        self.notify(&terminated.execution).await;

        Ok(terminated.execution)
    }

    /// Cancel `child_id` and, recursively, whatever it is waiting on.
    /// Descendants that already finished are left alone.
    pub fn cancel_descendants(
        &self,
        child_id: ChainId,
        cancelled_by: Option<String>,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let termination = Termination::Cancelled {
                reason: Some(PARENT_CANCELLED_REASON.to_string()),
                cancelled_by: cancelled_by.clone(),
            };

            match self.executor.terminate(&child_id, &termination).await {
                Ok(terminated) => {
                    info!(child_chain_id = %child_id, "Sub-chain cancelled with its parent");
                    if let Some(grandchild) = terminated.active_child {
                        self.cancel_descendants(grandchild, cancelled_by).await;
                    }
                    self.notify(&terminated.execution).await;
                }
                Err(ChainError::Conflict(_)) | Err(ChainError::ExecutionNotFound(_)) => {}
                Err(e) => {
                    warn!(child_chain_id = %child_id, error = %e, "Failed to cancel sub-chain");
                }
            }
        })
    }

    /// Best-effort cancellation notification; failures are only logged
    async fn notify(&self, execution: &ChainExecution) {
        let definition = match self
            .executor
            .definitions()
            .get(execution.chain_name())
            .await
        {
            Ok(Some(definition)) => definition,
            Ok(None) => return,
            Err(e) => {
                warn!(chain_id = %execution.chain_id(), error = %e, "Cannot load definition for cancel notification");
                return;
            }
        };

        let Some(target) = definition.on_cancel() else {
            return;
        };

        let payload = json!({
            "chain_id": execution.chain_id(),
            "chain_name": execution.chain_name(),
            "namespace": execution.namespace(),
            "tenant": execution.tenant(),
            "cancel_reason": execution.cancel_reason(),
            "cancelled_by": execution.cancelled_by(),
            "current_step": execution.current_step(),
            "total_steps": execution.total_steps(),
            "cancelled_at": Utc::now(),
        });

        let request = ProviderRequest::new(&target.provider, &target.action_type, payload)
            .with_origin(
                execution.chain_id().as_str(),
                execution.namespace(),
                execution.tenant(),
            );

        if let Err(e) = self.executor.evaluator().notify(request).await {
            warn!(
                chain_id = %execution.chain_id(),
                provider = %target.provider,
                error = %e,
                "Cancellation notification failed"
            );
        }
    }
}

fn in_scope(execution: &ChainExecution, request: &CancelRequest) -> bool {
    request
        .namespace
        .as_deref()
        .is_none_or(|namespace| namespace == execution.namespace())
        && request
            .tenant
            .as_deref()
            .is_none_or(|tenant| tenant == execution.tenant())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain::{
        ChainDefinition, ChainExecutionRepository, ChainStatus, ChainStep, NotificationTarget,
        ProviderStep, StepStatus,
    };
    use crate::infrastructure::chain::executor::StartExecution;
    use crate::infrastructure::chain::testing::{
        wait_for_status, wait_for_terminal, Harness, Script, ScriptedDispatcher,
    };
    use serde_json::json;
    use std::time::Duration;

    fn nested_chains() -> Vec<ChainDefinition> {
        vec![
            ChainDefinition::new("leaf").with_step(ChainStep::provider(
                "page",
                ProviderStep::new("pager", "page"),
            )),
            ChainDefinition::new("middle").with_step(ChainStep::sub_chain("call", "leaf")),
            ChainDefinition::new("root")
                .with_on_cancel(NotificationTarget::new("slack", "cancelled"))
                .with_step(ChainStep::sub_chain("escalate", "middle"))
                .with_step(ChainStep::provider("close", ProviderStep::new("ticket", "close"))),
        ]
    }

    fn slow_pager() -> ScriptedDispatcher {
        ScriptedDispatcher::new().script("page", Script::ok(json!({})).after(Duration::from_secs(30)))
    }

    #[tokio::test]
    async fn test_cancel_cascades_to_descendants() {
        let harness = Harness::new(nested_chains(), slow_pager());
        let handler = CancellationHandler::new(harness.executor.clone());

        let root = harness
            .executor
            .start(StartExecution::new("root", "prod", "acme", json!({})))
            .await
            .unwrap();

        // Wait until the leaf is dispatching
        for _ in 0..500 {
            if harness.dispatcher.calls_for("page") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.dispatcher.calls_for("page"), 1);

        let cancelled = handler
            .cancel(
                CancelRequest::new(root.chain_id().clone())
                    .with_reason("false alarm")
                    .with_cancelled_by("oncall"),
            )
            .await
            .unwrap();

        assert_eq!(cancelled.status(), ChainStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason(), Some("false alarm"));
        assert_eq!(cancelled.steps()[0].status, StepStatus::Cancelled);

        let middle_id = cancelled.steps()[0].child_chain_id.clone().unwrap();
        let middle = wait_for_terminal(&harness.executions, &middle_id).await;
        assert_eq!(middle.status(), ChainStatus::Cancelled);
        assert_eq!(middle.cancel_reason(), Some(PARENT_CANCELLED_REASON));
        assert_eq!(middle.cancelled_by(), Some("oncall"));

        let leaf_id = middle.steps()[0].child_chain_id.clone().unwrap();
        let leaf = wait_for_terminal(&harness.executions, &leaf_id).await;
        assert_eq!(leaf.status(), ChainStatus::Cancelled);
        // The interrupted dispatch is never recorded
        assert!(leaf.steps().is_empty());

        // No active descendants remain
        let active = harness
            .executions
            .list(&crate::domain::chain::ExecutionFilter::active())
            .await
            .unwrap();
        assert!(active.is_empty());

        let notifications = harness
            .dispatcher
            .calls()
            .into_iter()
            .filter(|c| c.action_type == "cancelled")
            .collect::<Vec<_>>();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].payload["cancel_reason"], json!("false alarm"));
        assert_eq!(notifications[0].payload["total_steps"], json!(2));
        assert_eq!(harness.dispatcher.calls_for("close"), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_execution_conflicts() {
        let chain = ChainDefinition::new("one")
            .with_step(ChainStep::provider("only", ProviderStep::new("p", "only")));
        let harness = Harness::new(vec![chain], ScriptedDispatcher::new());
        let handler = CancellationHandler::new(harness.executor.clone());

        let execution = harness
            .run(StartExecution::new("one", "prod", "acme", json!({})))
            .await;

        let result = handler
            .cancel(CancelRequest::new(execution.chain_id().clone()))
            .await;
        assert!(matches!(result, Err(ChainError::Conflict(_))));

        let stored = harness
            .executions
            .get(execution.chain_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status(), ChainStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_outside_scope_is_not_found() {
        let harness = Harness::new(nested_chains(), slow_pager());
        let handler = CancellationHandler::new(harness.executor.clone());

        let root = harness
            .executor
            .start(StartExecution::new("root", "prod", "acme", json!({})))
            .await
            .unwrap();

        let result = handler
            .cancel(CancelRequest::new(root.chain_id().clone()).with_scope("prod", "globex"))
            .await;
        assert!(matches!(result, Err(ChainError::ExecutionNotFound(_))));

        let missing = handler.cancel(CancelRequest::new(ChainId::generate())).await;
        assert!(matches!(missing, Err(ChainError::ExecutionNotFound(_))));

        handler
            .cancel(CancelRequest::new(root.chain_id().clone()).with_scope("prod", "acme"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_block_cancel() {
        let chain = ChainDefinition::new("waiting")
            .with_on_cancel(NotificationTarget::new("slack", "cancelled"))
            .with_step(
                ChainStep::provider("later", ProviderStep::new("p", "later")).with_delay_seconds(60),
            );
        let dispatcher = ScriptedDispatcher::new().script("cancelled", Script::fail("slack down"));
        let harness = Harness::new(vec![chain], dispatcher);
        let handler = CancellationHandler::new(harness.executor.clone());

        let execution = harness
            .executor
            .start(StartExecution::new("waiting", "prod", "acme", json!({})))
            .await
            .unwrap();
        assert!(execution.ready_at().is_some());

        let cancelled = handler
            .cancel(CancelRequest::new(execution.chain_id().clone()))
            .await
            .unwrap();
        assert_eq!(cancelled.status(), ChainStatus::Cancelled);
        assert_eq!(harness.dispatcher.calls_for("cancelled"), 1);
        assert_eq!(harness.dispatcher.calls_for("later"), 0);

        let stored = wait_for_status(&harness.executions, execution.chain_id(), |e| {
            e.is_terminal()
        })
        .await;
        assert_eq!(stored.status(), ChainStatus::Cancelled);
    }
}
