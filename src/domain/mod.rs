//! Domain layer - Core chain orchestration entities and ports

pub mod chain;
pub mod error;

pub use chain::{
    ChainDefinition, ChainDefinitionRepository, ChainError, ChainEvent, ChainEventKind,
    ChainExecution, ChainExecutionRepository, ChainId, ChainStatus, ChainStep, ChainStepKind,
    DagView, DeadLetterEntry, DeadLetterSink, EventPublisher, ExecutionFilter, ProviderDispatcher,
    ProviderRequest, StepRecord, StepStatus,
};
pub use error::DomainError;
