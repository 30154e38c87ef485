//! A choreography-based saga runtime: commands flow through a step
//! processor into a domain store, acks flow back through a result cache,
//! and failures flow sideways through a retry ladder into a dead-letter
//! topic until an operator replays them.

pub mod bus;
pub mod cache;
pub mod config;
pub mod dlq;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod processor;
pub mod retry;
pub mod runtime;
pub mod saga_log;
pub mod storage;
