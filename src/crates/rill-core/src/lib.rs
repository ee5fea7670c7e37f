//! # rill-core — Effect Scheduling and Change Notification
//!
//! **The concurrency core of a unidirectional state runtime**: state
//! transitions run synchronously and return *descriptions* of async work;
//! a scheduler executes those descriptions under cancellation, dedup,
//! debounce, and throttle policy; versioned path counters tell observers
//! exactly which slices of state moved.
//!
//! ## Overview
//!
//! `rill-core` provides:
//!
//! - **Effect descriptors** — immutable values describing deferred work:
//!   one-shot tasks, long-lived subscriptions, fire-and-forget units, and
//!   parallel/sequential compositions
//! - **Single-flight execution** — at most one unit per cancellation key,
//!   with drop-duplicate or cancel-in-flight policy
//! - **Timing policy** — debounce (delay-then-run, cancellable during the
//!   delay) and throttle (drop inside a cooldown window)
//! - **A serial dispatcher** — one loop owns state; actions apply in order
//!   and effect outputs feed back in as new actions
//! - **Granular notifications** — per-path version counters with one-level
//!   fan-out to declared derived paths
//!
//! ## Architecture
//!
//! ```text
//! caller ──send(action)──► Dispatcher ──────────────────────────┐
//!                              │                                │
//!                              ▼                                │
//!                    transition(&mut scope, action)             │
//!                    (sync mutation + touched paths)            │
//!                              │                                │
//!                ┌─────────────┴─────────────┐                  │
//!                ▼                           ▼                  │
//!          ChangeGraph.write()        Effect descriptor         │
//!          (version bumps,                   │                  │
//!           observer wakeups)                ▼                  │
//!                                     Scheduler.submit          │
//!                                     (dedup / debounce /       │
//!                                      throttle / cancel)       │
//!                                            │                  │
//!                                            ▼                  │
//!                                     output(s) ──send()────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rill_core::{Dispatcher, Effect};
//!
//! #[derive(Debug, Default)]
//! struct AppState {
//!     query: String,
//!     results: Vec<String>,
//! }
//!
//! #[derive(Debug)]
//! enum AppAction {
//!     QueryChanged(String),
//!     ResultsLoaded(Vec<String>),
//! }
//!
//! struct SearchApi;
//!
//! impl SearchApi {
//!     async fn search(&self, query: &str) -> Vec<String> {
//!         vec![query.to_string()]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Dispatcher::spawn(
//!         AppState::default(),
//!         SearchApi,
//!         vec![("result_count", vec!["results"])],
//!         |scope, action: AppAction| match action {
//!             AppAction::QueryChanged(query) => {
//!                 scope.set("query", |s| &mut s.query, query.clone());
//!                 Effect::task(move |api: Arc<SearchApi>| async move {
//!                     Ok(AppAction::ResultsLoaded(api.search(&query).await))
//!                 })
//!                 .cancellable("search", true)
//!                 .debounce(Duration::from_millis(300))
//!             }
//!             AppAction::ResultsLoaded(results) => {
//!                 scope.set("results", |s| &mut s.results, results);
//!                 Effect::none()
//!             }
//!         },
//!     );
//!
//!     dispatcher
//!         .send(AppAction::QueryChanged("rill".into()))
//!         .unwrap();
//! }
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Effects are values** — nothing runs at construction time; the
//!    scheduler is the only executor
//! 2. **Single-flight per key** — a cancellation key names at most one
//!    in-flight unit
//! 3. **State is mutated only inside transitions** — effect bodies produce
//!    outputs that re-enter the dispatcher; they never touch state directly
//! 4. **Errors stay inside the scheduler** — a failing body either produces
//!    a substitute output through its `on_error` handler or is logged and
//!    swallowed; cancellation is always silent
//! 5. **Equal writes are invisible** — writing a value equal to the stored
//!    one bumps no version and wakes no observer
//!
//! ## Module Organization
//!
//! - [`effect`] — descriptor model and combinators
//! - [`scheduler`] — execution engine and keyed-unit registry
//! - [`dispatcher`] — serial run loop and observation surface
//! - [`mutation`] — write-recording state view for transitions
//! - [`notify`] — path versions and dependency fan-out
//! - [`error`] — error types

pub mod dispatcher;
pub mod effect;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod scheduler;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use effect::{CancelKey, Effect, Priority};
pub use error::{BoxError, DispatchError, Result};
pub use mutation::MutationScope;
pub use notify::{ChangeBatch, ChangeGraph, PathId};
pub use scheduler::{Emitter, Scheduler};
