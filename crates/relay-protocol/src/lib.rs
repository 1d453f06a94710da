//! Wire types for the relay run streaming service.
//!
//! This crate defines the records and event envelopes exchanged across the
//! relay boundaries:
//!
//! ```text
//! Client <--[HTTP + SSE: EventMessage frames]--> relay <--[GraphEvent]--> Graph engine
//!                                                  |
//!                                            ThreadStore (threads, runs)
//! ```
//!
//! ## Design Principles
//!
//! 1. **Threads are persistent, events are ephemeral.** Thread and run records
//!    live in a store. Events only live in a per-run queue until it is reaped.
//! 2. **Every run stream ends with exactly one terminal event.** See
//!    [`events::TerminalKind`].
//! 3. **Engine-agnostic.** Payloads are plain JSON values; nothing here knows
//!    how a graph computes its state.

pub mod events;
pub mod models;

pub use events::{EventMessage, TerminalKind};
pub use models::{
    Assistant, CancelAction, IfExists, MAX_SEARCH_LIMIT, Metadata, MultitaskStrategy,
    OnDisconnect, Run, RunConfig, RunCreate, RunListQuery, RunPatch, RunStatus, RunStreamPayload,
    SortOrder, StreamMode, Thread, ThreadCreate, ThreadPatch, ThreadSearch, ThreadSortBy,
    ThreadStatus,
};
