//! Execution engine for effect descriptors.
//!
//! The scheduler consumes [`Effect`] values and drives them to completion:
//! it applies dedup/debounce/throttle policy through its keyed-unit
//! registry, runs bodies on the executor pool with cooperative cancellation, converts
//! body failures into substitute outputs (or logs and swallows them), and
//! composes children concurrently or in order.
//!
//! Outputs are delivered two ways, matching how the dispatcher consumes
//! them: the single output of a top-level one-shot task is the return value
//! of [`Scheduler::submit`]; subscription elements and the outputs of
//! composition children go through the [`Emitter`] callback.
//!
//! Domain errors never leave [`Scheduler::submit`] as errors. Cancellation
//! is a distinct, always-silent outcome and is never routed through an
//! `on_error` handler.

mod registry;


use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{future, FutureExt, StreamExt};

use crate::effect::{CancelKey, Effect, SubscriptionEffect, TaskEffect};

use registry::{Admission, RegistrationGuard, TaskRegistry};

/// Callback receiving every output a running effect produces along the way.
pub type Emitter<A> = Arc<dyn Fn(A) + Send + Sync>;

/// How a unit of work finished, as seen by its parent composition.
///
/// `Concatenate` needs to tell "cancelled" apart from "produced nothing":
/// only the former aborts the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion<A> {
    /// Finished normally with an output.
    Produced(A),
    /// Finished normally without an output.
    Empty,
    /// Never started: dedup, throttle, or shutdown dropped it.
    Dropped,
    /// Started and was cancelled before finishing.
    Cancelled,
}

/// The execution engine. Cheap to clone; clones share one registry.
///
/// The environment is supplied per submission and passed unchanged into
/// every effect body.
pub struct Scheduler<K> {
    registry: Arc<TaskRegistry<K>>,
}

impl<K> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new()),
        }
    }

    /// Number of keyed units currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.active()
    }

    /// Whether [`Scheduler::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.registry.is_closed()
    }

    /// Cancel every registered unit without refusing new submissions.
    pub fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    /// Stop accepting submissions, then cancel every registered unit.
    /// Invoked by the dispatcher on teardown.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl<K: CancelKey> Scheduler<K> {
    /// Cancel and deregister the unit running under `key`; a no-op when the
    /// key is unknown.
    pub fn cancel(&self, key: &K) {
        if !self.registry.cancel(key) {
            tracing::debug!(key = ?key, "cancel ignored: no unit under key");
        }
    }

    /// Drive `effect` to completion.
    ///
    /// Returns the output of a top-level one-shot task, or `None` when the
    /// effect was dropped (dedup/throttle/shutdown), cancelled, failed
    /// without a recovery handler, or produces its outputs through `emit`
    /// (subscriptions and compositions).
    pub async fn submit<A, E>(&self, effect: Effect<A, E, K>, env: Arc<E>, emit: Emitter<A>) -> Option<A>
    where
        A: Send + 'static,
        E: Send + Sync + 'static,
    {
        match self.run(effect, env, emit).await {
            Completion::Produced(output) => Some(output),
            _ => None,
        }
    }

    fn run<A, E>(
        &self,
        effect: Effect<A, E, K>,
        env: Arc<E>,
        emit: Emitter<A>,
    ) -> BoxFuture<'static, Completion<A>>
    where
        A: Send + 'static,
        E: Send + Sync + 'static,
    {
        let this = self.clone();
        async move {
            match effect {
                Effect::None => Completion::Empty,
                Effect::Cancel(key) => {
                    this.cancel(&key);
                    Completion::Empty
                }
                Effect::Task(task) => this.run_task(task, env).await,
                Effect::Subscription(sub) => this.run_subscription(sub, env, emit).await,
                Effect::FireAndForget(fx) => {
                    if this.registry.is_closed() {
                        tracing::warn!("dropping fire-and-forget: scheduler is shut down");
                        return Completion::Dropped;
                    }
                    let priority = fx.priority;
                    tokio::spawn(async move {
                        if let Err(error) = (fx.body)(env).await {
                            tracing::error!(%error, ?priority, "fire-and-forget effect failed");
                        }
                    });
                    Completion::Empty
                }
                Effect::Merge(children) => {
                    let units: Vec<_> = children
                        .into_iter()
                        .map(|child| this.run(child, env.clone(), emit.clone()))
                        .collect();
                    let completions = future::join_all(units).await;
                    let mut all_cancelled = !completions.is_empty();
                    for completion in completions {
                        match completion {
                            Completion::Produced(output) => {
                                all_cancelled = false;
                                emit(output);
                            }
                            Completion::Cancelled => {}
                            Completion::Empty | Completion::Dropped => all_cancelled = false,
                        }
                    }
                    if all_cancelled {
                        Completion::Cancelled
                    } else {
                        Completion::Empty
                    }
                }
                Effect::Concatenate(children) => {
                    for child in children {
                        match this.run(child, env.clone(), emit.clone()).await {
                            Completion::Produced(output) => emit(output),
                            Completion::Cancelled => {
                                tracing::debug!("sequential chain aborted: child was cancelled");
                                return Completion::Cancelled;
                            }
                            Completion::Empty | Completion::Dropped => {}
                        }
                    }
                    Completion::Empty
                }
            }
        }
        .boxed()
    }

    async fn run_task<A, E>(&self, task: TaskEffect<A, E, K>, env: Arc<E>) -> Completion<A>
    where
        A: Send + 'static,
        E: Send + Sync + 'static,
    {
        let TaskEffect {
            priority,
            cancel_key,
            cancel_in_flight,
            debounce,
            throttle,
            body,
            on_error,
        } = task;

        let (cancellation, _guard) = match cancel_key {
            Some(key) => match self.registry.admit(&key, cancel_in_flight, throttle) {
                Admission::Closed => {
                    tracing::warn!(key = ?key, "dropping task: scheduler is shut down");
                    return Completion::Dropped;
                }
                Admission::DuplicateDropped => {
                    tracing::info!(key = ?key, "dropping task: a unit is already in flight");
                    return Completion::Dropped;
                }
                Admission::Throttled => {
                    tracing::debug!(key = ?key, window = ?throttle, "dropping task: inside throttle window");
                    return Completion::Dropped;
                }
                Admission::Started(registration) => (
                    Some(registration.token),
                    Some(RegistrationGuard::new(
                        self.registry.clone(),
                        key,
                        registration.id,
                    )),
                ),
            },
            None => {
                // Unkeyed tasks cannot be throttled; the combinator enforces it.
                debug_assert!(throttle.is_none());
                if self.registry.is_closed() {
                    tracing::warn!("dropping task: scheduler is shut down");
                    return Completion::Dropped;
                }
                (None, None)
            }
        };

        let work = async move {
            if let Some(delay) = debounce {
                tokio::time::sleep(delay).await;
            }
            body(env).await
        };

        let result = match cancellation {
            Some(mut token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(?priority, "task cancelled");
                        return Completion::Cancelled;
                    }
                    result = work => result,
                }
            }
            None => work.await,
        };

        match result {
            Ok(output) => Completion::Produced(output),
            Err(error) => match on_error {
                Some(handler) => Completion::Produced(handler(error)),
                None => {
                    tracing::error!(%error, ?priority, "task effect failed");
                    Completion::Empty
                }
            },
        }
    }

    async fn run_subscription<A, E>(
        &self,
        sub: SubscriptionEffect<A, E, K>,
        env: Arc<E>,
        emit: Emitter<A>,
    ) -> Completion<A>
    where
        A: Send + 'static,
        E: Send + Sync + 'static,
    {
        let SubscriptionEffect {
            cancel_key: key,
            body,
            on_error,
        } = sub;

        let (mut token, _guard) = match self.registry.admit(&key, false, None) {
            Admission::Closed => {
                tracing::warn!(key = ?key, "dropping subscription: scheduler is shut down");
                return Completion::Dropped;
            }
            Admission::DuplicateDropped => {
                tracing::info!(key = ?key, "dropping subscription: a unit is already in flight");
                return Completion::Dropped;
            }
            // Subscriptions are never throttled; admission without a window
            // cannot return this.
            Admission::Throttled => return Completion::Dropped,
            Admission::Started(registration) => (
                registration.token,
                RegistrationGuard::new(self.registry.clone(), key, registration.id),
            ),
        };

        let mut stream = body(env);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("subscription cancelled");
                    return Completion::Cancelled;
                }
                item = stream.next() => match item {
                    None => {
                        tracing::debug!("subscription source ended");
                        return Completion::Empty;
                    }
                    Some(Ok(output)) => emit(output),
                    Some(Err(error)) => {
                        match &on_error {
                            Some(handler) => emit(handler(error)),
                            None => tracing::error!(%error, "subscription effect failed"),
                        }
                        return Completion::Empty;
                    }
                },
            }
        }
    }
}
