//! classbus - class change notifications over a broker, with a cache-aside
//! read path.
//!
//! Writes go through `service::ClassService` (persist, cache, notify). Events
//! travel through the broker topology in `bus`, are consumed by the worker
//! pool in `consumer`, and anything rejected or expired ends up in the
//! dead-letter sink in `dlq`.

pub mod bus;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod model;
pub mod publisher;
pub mod service;
pub mod storage;
pub mod utils;
