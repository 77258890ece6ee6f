pub mod config;
pub mod consumer;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod search;
pub mod shutdown;
pub mod similarity;
