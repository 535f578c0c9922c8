//! Provider adapters

mod http_dispatcher;

pub use http_dispatcher::{HttpProviderDispatcher, ProviderEndpoint};
