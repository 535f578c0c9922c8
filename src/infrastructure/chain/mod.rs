//! Chain runtime: executor, coordinators and in-memory adapters

mod cancellation;
mod dead_letter;
mod definition_loader;
mod events;
mod executor;
mod in_memory_definition_repository;
mod in_memory_execution_repository;
mod parallel;
mod signal;
mod step_evaluator;
mod sub_chain;
mod timeout;

#[cfg(test)]
pub mod testing;

pub use cancellation::{CancelRequest, CancellationHandler, PARENT_CANCELLED_REASON};
pub use dead_letter::InMemoryDeadLetterQueue;
pub use definition_loader::{load_definitions, load_repository, parse_definitions};
pub use events::BroadcastEventPublisher;
pub use executor::{
    ChainExecutor, ChainExecutorConfig, StartExecution, Terminated, Termination,
};
pub use in_memory_definition_repository::InMemoryChainDefinitionRepository;
pub use in_memory_execution_repository::InMemoryChainExecutionRepository;
pub use parallel::{ParallelCoordinator, ParallelOutcome};
pub use step_evaluator::{RetryPolicy, StepEvaluator, StepOutcome};
pub use sub_chain::{SpawnedChild, SubChainSpawner};
pub use timeout::TimeoutSupervisor;
