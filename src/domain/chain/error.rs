//! Chain engine error types

use thiserror::Error;

use crate::domain::error::DomainError;

/// Errors surfaced by the chain engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("Chain definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Chain execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ChainError {
    pub fn definition_not_found(name: impl Into<String>) -> Self {
        Self::DefinitionNotFound(name.into())
    }

    pub fn execution_not_found(id: impl Into<String>) -> Self {
        Self::ExecutionNotFound(id.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::Template(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Systemic errors are retried on the next scheduling pass
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<DomainError> for ChainError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Conflict { message } => Self::Conflict(message),
            DomainError::NotFound { message } => Self::ExecutionNotFound(message),
            DomainError::Validation { message } => Self::Validation(message),
            other => Self::Storage(other.to_string()),
        }
    }
}
