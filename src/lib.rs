pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod lifecycle;
pub mod mqtt;
pub mod normalize;
pub mod pipeline;
pub mod reading;
pub mod store;
pub mod writer;
