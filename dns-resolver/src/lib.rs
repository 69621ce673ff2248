pub mod cache;
pub mod context;
pub mod metrics;
pub mod responder;
