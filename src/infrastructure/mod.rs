//! Infrastructure layer - Chain runtime and external service implementations

pub mod chain;
pub mod observability;
pub mod provider;
pub mod services;
