//! Lifecycle events emitted by the chain engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ChainExecution, ChainId, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEventKind {
    Started,
    StepCompleted {
        step: String,
        index: usize,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    WaitingSubChain {
        step: String,
        child_chain_id: ChainId,
    },
    Resumed {
        step: String,
        child_chain_id: ChainId,
    },
    Completed,
    Failed {
        error: String,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelled_by: Option<String>,
    },
    TimedOut,
}

/// One lifecycle transition of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub chain_id: ChainId,
    pub chain_name: String,
    pub namespace: String,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<ChainId>,
    #[serde(flatten)]
    pub kind: ChainEventKind,
}

impl ChainEvent {
    pub fn new(execution: &ChainExecution, kind: ChainEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            chain_id: execution.chain_id().clone(),
            chain_name: execution.chain_name().to_string(),
            namespace: execution.namespace().to_string(),
            tenant: execution.tenant().to_string(),
            parent_chain_id: execution.parent_chain_id().cloned(),
            kind,
        }
    }

    /// Terminal event for an execution's current terminal status
    pub fn terminal(execution: &ChainExecution) -> Option<Self> {
        use super::execution::ChainStatus;

        let kind = match execution.status() {
            ChainStatus::Completed => ChainEventKind::Completed,
            ChainStatus::Failed => ChainEventKind::Failed {
                error: execution.error().unwrap_or("unknown error").to_string(),
            },
            ChainStatus::Cancelled => ChainEventKind::Cancelled {
                reason: execution.cancel_reason().map(str::to_string),
                cancelled_by: execution.cancelled_by().map(str::to_string),
            },
            ChainStatus::TimedOut => ChainEventKind::TimedOut,
            ChainStatus::Running | ChainStatus::WaitingSubChain => return None,
        };
        Some(Self::new(execution, kind))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ChainEventKind::Completed
                | ChainEventKind::Failed { .. }
                | ChainEventKind::Cancelled { .. }
                | ChainEventKind::TimedOut
        )
    }
}

/// Fan-out of lifecycle events; publishing never blocks the caller
pub trait EventPublisher: Send + Sync + std::fmt::Debug {
    fn publish(&self, event: ChainEvent);
}
