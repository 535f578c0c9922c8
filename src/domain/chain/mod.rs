//! Chain domain - definitions, executions and the collaborator ports
//!
//! A chain is a named multi-step workflow of provider actions, parallel
//! fan-outs and sub-chain invocations. An execution is one stateful run of a
//! chain, advanced step by step by the executor in the infrastructure layer.

mod branch;
mod dag;
mod dead_letter;
mod definition;
mod error;
mod event;
mod execution;
mod provider;
pub mod repository;
mod template;

pub use branch::{
    resolve_field, resolve_next_step, sequential_next, BranchCondition, BranchOperator, NextStep,
};
pub use dag::{DagEdge, DagNode, DagSubStep, DagView};
pub use dead_letter::{DeadLetterEntry, DeadLetterSink};
pub use definition::{
    validate_definitions, ChainDefinition, ChainFailurePolicy, ChainStep, ChainStepKind,
    NotificationTarget, ParallelFailurePolicy, ParallelJoinPolicy, ParallelStep, ParallelSubStep,
    ProviderStep, StepFailurePolicy, SubChainStep,
};
pub use error::ChainError;
pub use event::{ChainEvent, ChainEventKind, EventPublisher};
pub use execution::{
    seconds_after, ChainExecution, ChainId, ChainStatus, ExecutionFilter, StepKind, StepRecord,
    StepStatus,
};
pub use provider::{ProviderDispatcher, ProviderRequest};
pub use repository::{ChainDefinitionRepository, ChainExecutionRepository};
pub use template::{get_nested_field, validate_template, TemplateContext};

#[cfg(test)]
pub use provider::MockProviderDispatcher;
