//! Serial coordinator between state transitions and the scheduler.
//!
//! The dispatcher owns the single authoritative copy of state. Every action
//! goes through one loop task: the transition function mutates state
//! synchronously through a [`MutationScope`], the touched paths are pushed
//! into the [`ChangeGraph`] and broadcast to observers, and the returned
//! effect is handed to the scheduler — `cancel` inline so it pre-empts
//! queued work, everything else as a spawned unit whose outputs re-enter
//! [`Dispatcher::send`] as new actions.
//!
//! Ordering contract: caller-issued actions apply in call order; the effect
//! of one transition is dispatched before the next action is processed;
//! concurrently running units complete and re-enter `send` in any order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, mpsc};

use crate::effect::{CancelKey, Effect};
use crate::error::{DispatchError, Result};
use crate::mutation::MutationScope;
use crate::notify::{ChangeBatch, ChangeGraph, PathId};
use crate::scheduler::{Emitter, Scheduler};

/// Tuning knobs for a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the change-notification broadcast channel. Slow observers
    /// that fall more than this many batches behind see a lag error and
    /// should re-read their paths.
    pub change_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            change_capacity: 64,
        }
    }
}

enum Msg<A> {
    Action(A),
    Stop,
}

/// The serial coordinator. Owns state, the scheduler, and the change graph.
///
/// Dropping the dispatcher shuts it down: in-flight units are cancelled and
/// further `send` calls fail with [`DispatchError::Closed`].
pub struct Dispatcher<S, A, K, P> {
    tx: mpsc::UnboundedSender<Msg<A>>,
    state: Arc<RwLock<S>>,
    graph: Arc<Mutex<ChangeGraph<P>>>,
    changes: broadcast::Sender<ChangeBatch<P>>,
    scheduler: Scheduler<K>,
    closed: Arc<AtomicBool>,
}

impl<S, A, K, P> Dispatcher<S, A, K, P>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
    K: CancelKey,
    P: PathId,
{
    /// Spawn a dispatcher with the default configuration.
    ///
    /// `derivations` declares computed paths as `(derived, sources)` pairs;
    /// a write to any source also bumps the derived path's version.
    pub fn spawn<E, F>(
        initial: S,
        environment: E,
        derivations: Vec<(P, Vec<P>)>,
        transition: F,
    ) -> Self
    where
        E: Send + Sync + 'static,
        F: FnMut(&mut MutationScope<'_, S, P>, A) -> Effect<A, E, K> + Send + 'static,
    {
        Self::spawn_with_config(
            initial,
            environment,
            derivations,
            DispatcherConfig::default(),
            transition,
        )
    }

    /// Spawn a dispatcher and its loop task.
    pub fn spawn_with_config<E, F>(
        initial: S,
        environment: E,
        derivations: Vec<(P, Vec<P>)>,
        config: DispatcherConfig,
        mut transition: F,
    ) -> Self
    where
        E: Send + Sync + 'static,
        F: FnMut(&mut MutationScope<'_, S, P>, A) -> Effect<A, E, K> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(initial));
        let graph = Arc::new(Mutex::new(ChangeGraph::with_derivations(derivations)));
        let (changes, _) = broadcast::channel(config.change_capacity);
        let scheduler: Scheduler<K> = Scheduler::new();
        let env = Arc::new(environment);
        let closed = Arc::new(AtomicBool::new(false));

        let loop_state = state.clone();
        let loop_graph = graph.clone();
        let loop_changes = changes.clone();
        let loop_scheduler = scheduler.clone();
        let loop_tx = tx.clone();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let action = match msg {
                    Msg::Action(action) => action,
                    Msg::Stop => break,
                };

                // Phase 1: synchronous mutation. The write lock is held only
                // for the duration of the transition call.
                let (effect, touched) = {
                    let mut state = loop_state.write().unwrap();
                    let mut scope = MutationScope::new(&mut *state);
                    let effect = transition(&mut scope, action);
                    (effect, scope.into_touched())
                };

                // Phase 2: notify once per distinct touched path.
                if !touched.is_empty() {
                    let bumped = {
                        let mut graph = loop_graph.lock().unwrap();
                        let mut bumped = Vec::new();
                        for path in &touched {
                            for hit in graph.write(path) {
                                if !bumped.contains(&hit) {
                                    bumped.push(hit);
                                }
                            }
                        }
                        bumped
                    };
                    if !bumped.is_empty() {
                        let _ = loop_changes.send(ChangeBatch { paths: bumped });
                    }
                }

                // Phase 3: dispatch the effect. Cancellation pre-empts;
                // everything else runs as its own unit.
                match effect {
                    Effect::None => {}
                    Effect::Cancel(key) => loop_scheduler.cancel(&key),
                    effect => {
                        tracing::debug!(kind = effect.kind(), "dispatching effect");
                        let scheduler = loop_scheduler.clone();
                        let env = env.clone();
                        let feedback = loop_tx.clone();
                        let emitter: Emitter<A> = {
                            let feedback = loop_tx.clone();
                            Arc::new(move |output| {
                                let _ = feedback.send(Msg::Action(output));
                            })
                        };
                        tokio::spawn(async move {
                            if let Some(output) = scheduler.submit(effect, env, emitter).await {
                                let _ = feedback.send(Msg::Action(output));
                            }
                        });
                    }
                }
            }
            tracing::debug!("dispatcher loop stopped");
        });

        Self {
            tx,
            state,
            graph,
            changes,
            scheduler,
            closed,
        }
    }

    /// Feed an action into the run loop.
    ///
    /// Actions are applied strictly in send order. Outputs of running
    /// effects re-enter here through the loop's emitter.
    pub fn send(&self, action: A) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        self.tx
            .send(Msg::Action(action))
            .map_err(|_| DispatchError::Closed)
    }

    /// Current version of `path`, registering it on first read.
    ///
    /// Observers hold `(path, last_seen_version)` and re-read when the
    /// version moves.
    pub fn version(&self, path: &P) -> u64 {
        self.graph.lock().unwrap().read(path)
    }

    /// Subscribe to change batches. Each batch lists the paths whose
    /// versions were bumped by one transition.
    pub fn watch(&self) -> broadcast::Receiver<ChangeBatch<P>> {
        self.changes.subscribe()
    }

    /// Read the current state.
    pub fn with_state<R>(&self, read: impl FnOnce(&S) -> R) -> R {
        let state = self.state.read().unwrap();
        read(&state)
    }

    /// Handle to the underlying scheduler, e.g. for out-of-band
    /// cancellation.
    pub fn scheduler(&self) -> &Scheduler<K> {
        &self.scheduler
    }
}

impl<S, A, K, P> Dispatcher<S, A, K, P> {
    /// Stop accepting actions and cancel every in-flight unit.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        let _ = self.tx.send(Msg::Stop);
    }
}

impl<S, A, K, P> Drop for Dispatcher<S, A, K, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
