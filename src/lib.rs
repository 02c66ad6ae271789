//! MySQL query capture, corpus building, and replay load testing.
//!
//! Two pipelines share the core data model:
//!
//! - **collect**: Extractor → Processor ×N → Sink; turns packet captures or
//!   text protocol dumps into a canonicalized, deduplicated replay corpus.
//! - **replay**: a weighted query source backed by a memory-mapped corpus,
//!   executing sampled queries against a target MySQL instance at
//!   controlled concurrency/rate with live statistics reporting.

pub mod cache;
pub mod codec;
pub mod collect;
pub mod config;
pub mod dbpool;
pub mod query;
pub mod replay;
pub mod ring;
pub mod sqlnorm;
