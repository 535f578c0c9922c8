//! Infrastructure services

mod chain_service;

pub use chain_service::ChainService;
