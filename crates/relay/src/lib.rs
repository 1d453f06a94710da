//! Streams graph runs to HTTP clients.
//!
//! A run's events flow from the engine into a per-run queue and out to any
//! number of SSE readers, while threads and runs are persisted in a
//! [`store::ThreadStore`].

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod queue;
pub mod runs;
pub mod store;
