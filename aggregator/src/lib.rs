//! # Aggregator
//!
//! A publish-subscribe log aggregator with an idempotent consumer. Producers
//! submit event batches over HTTP; events flow through a durable queue to a
//! pool of workers that record each `(topic, event_id)` identity exactly once,
//! even under concurrent retries and restarts.

pub mod api;
pub mod config;
pub mod event;
pub mod metrics;
pub mod publish;
pub mod query;
pub mod queue;
pub mod retry;
pub mod router;
pub mod server;
pub mod store;
pub mod worker;
