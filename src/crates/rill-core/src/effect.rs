//! Effect descriptors — immutable values describing deferred work.
//!
//! An [`Effect`] is pure data: it says *what* should run (a one-shot task, a
//! long-lived subscription, a detached fire-and-forget unit), under which
//! cancellation key, and with which timing policy (debounce, throttle). It
//! does nothing until the scheduler executes it. Transitions return effects;
//! the dispatcher hands them to the scheduler; outputs re-enter the
//! dispatcher as new actions.
//!
//! Compositions run children concurrently ([`Effect::merge`]) or strictly in
//! order ([`Effect::concatenate`]). Policy combinators ([`Effect::map`],
//! [`Effect::cancellable`], [`Effect::debounce`], [`Effect::throttle`],
//! [`Effect::priority`], [`Effect::on_error`]) return new descriptors and
//! rewrite every leaf of a composition — a composition never carries a
//! cancellation key of its own, so "which unit does this key name" is always
//! unambiguous.
//!
//! # Example
//!
//! ```rust,ignore
//! let effect = Effect::task(|env: Arc<Api>| async move {
//!     let user = env.fetch_user().await?;
//!     Ok(Action::UserLoaded(user))
//! })
//! .cancellable("load-user", true)
//! .debounce(Duration::from_millis(300));
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Cancellation key bound: at most one unit of work may be in flight per key.
///
/// Blanket-implemented for every type that satisfies the bounds; strings,
/// integers, and enums all work.
pub trait CancelKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> CancelKey for T {}

/// Relative urgency attached to a task or fire-and-forget descriptor.
///
/// The executor has no priority lanes; the value travels with the descriptor
/// and shows up in tracing fields so operators can tell routine work from
/// urgent work in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work; fine to be slow.
    Low,
    /// The default for every constructor.
    #[default]
    Normal,
    /// User-visible work.
    High,
}

pub(crate) type TaskBody<A, E> =
    Box<dyn FnOnce(Arc<E>) -> BoxFuture<'static, std::result::Result<A, BoxError>> + Send>;

pub(crate) type StreamBody<A, E> =
    Box<dyn FnOnce(Arc<E>) -> BoxStream<'static, std::result::Result<A, BoxError>> + Send>;

pub(crate) type VoidBody<E> =
    Box<dyn FnOnce(Arc<E>) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send>;

pub(crate) type ErrorHandler<A> = Arc<dyn Fn(BoxError) -> A + Send + Sync>;

/// A one-shot unit of work: one output, once.
pub struct TaskEffect<A, E, K> {
    pub(crate) priority: Priority,
    pub(crate) cancel_key: Option<K>,
    pub(crate) cancel_in_flight: bool,
    pub(crate) debounce: Option<Duration>,
    pub(crate) throttle: Option<Duration>,
    pub(crate) body: TaskBody<A, E>,
    pub(crate) on_error: Option<ErrorHandler<A>>,
}

/// A long-lived unit: zero or more outputs until the source ends, errors, or
/// is cancelled. Always keyed — the key is a constructor argument, so an
/// unkeyed subscription cannot be expressed.
pub struct SubscriptionEffect<A, E, K> {
    pub(crate) cancel_key: K,
    pub(crate) body: StreamBody<A, E>,
    pub(crate) on_error: Option<ErrorHandler<A>>,
}

/// A detached side effect: no output, no cancellation tracking.
pub struct FireAndForgetEffect<E> {
    pub(crate) priority: Priority,
    pub(crate) body: VoidBody<E>,
}

/// Description of deferred work returned by a state transition.
///
/// Type parameters: `A` is the output (fed back into the dispatcher as an
/// action), `E` the consumer-supplied environment passed into every body,
/// `K` the cancellation key type.
pub enum Effect<A, E, K> {
    /// No effect.
    None,
    /// Request cancellation of the unit running under the key.
    Cancel(K),
    /// One-shot task.
    Task(TaskEffect<A, E, K>),
    /// Long-lived subscription.
    Subscription(SubscriptionEffect<A, E, K>),
    /// Detached, output-less unit.
    FireAndForget(FireAndForgetEffect<E>),
    /// Run children concurrently.
    Merge(Vec<Effect<A, E, K>>),
    /// Run children strictly in order; a cancelled child aborts the rest.
    Concatenate(Vec<Effect<A, E, K>>),
}

impl<A, E, K> Effect<A, E, K>
where
    A: Send + 'static,
    E: Send + Sync + 'static,
    K: CancelKey,
{
    /// No effect.
    pub fn none() -> Self {
        Effect::None
    }

    /// Cancel the in-flight unit registered under `key`, if any.
    pub fn cancel(key: K) -> Self {
        Effect::Cancel(key)
    }

    /// A one-shot task producing a single output.
    ///
    /// The body runs on the executor pool, receives the environment, and may
    /// fail with [`BoxError`]; a failure is recoverable only through
    /// [`Effect::on_error`], otherwise it is logged and dropped.
    pub fn task<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Arc<E>) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<A, BoxError>> + Send + 'static,
    {
        Effect::Task(TaskEffect {
            priority: Priority::default(),
            cancel_key: None,
            cancel_in_flight: false,
            debounce: None,
            throttle: None,
            body: Box::new(move |env| body(env).boxed()),
            on_error: None,
        })
    }

    /// A long-lived subscription emitting every element of the stream the
    /// body produces, until the stream ends, fails, or `key` is cancelled.
    pub fn subscribe<F, St>(key: K, body: F) -> Self
    where
        F: FnOnce(Arc<E>) -> St + Send + 'static,
        St: Stream<Item = std::result::Result<A, BoxError>> + Send + 'static,
    {
        Effect::Subscription(SubscriptionEffect {
            cancel_key: key,
            body: Box::new(move |env| body(env).boxed()),
            on_error: None,
        })
    }

    /// A detached side effect with no output and no cancellation tracking.
    pub fn fire_and_forget<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Arc<E>) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Effect::FireAndForget(FireAndForgetEffect {
            priority: Priority::default(),
            body: Box::new(move |env| body(env).boxed()),
        })
    }

    /// Run `children` concurrently. Collapses: empty input is [`Effect::None`],
    /// a single child is returned as-is.
    pub fn merge(mut children: Vec<Self>) -> Self {
        match children.len() {
            0 => Effect::None,
            1 => children.pop().expect("len checked"),
            _ => Effect::Merge(children),
        }
    }

    /// Run `children` strictly in order. Same collapse rules as
    /// [`Effect::merge`]; a cancelled child aborts the remaining chain at
    /// execution time.
    pub fn concatenate(mut children: Vec<Self>) -> Self {
        match children.len() {
            0 => Effect::None,
            1 => children.pop().expect("len checked"),
            _ => Effect::Concatenate(children),
        }
    }

    /// Rewrite the eventual output(s) of this effect.
    ///
    /// # Panics
    ///
    /// Panics when applied directly to [`Effect::None`], [`Effect::Cancel`],
    /// or [`Effect::FireAndForget`] — those never produce an output, so
    /// mapping one is a bug in the calling feature. The same variants nested
    /// inside a composition pass through untouched.
    pub fn map<B, F>(self, f: F) -> Effect<B, E, K>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + Clone + 'static,
    {
        match self {
            Effect::None | Effect::Cancel(_) | Effect::FireAndForget(_) => {
                panic!("cannot map an effect that never produces an output")
            }
            other => map_effect(other, f),
        }
    }

    /// Attach a cancellation key to every task leaf.
    ///
    /// With `cancel_in_flight == false` a later submission under a busy key
    /// is dropped and the incumbent keeps running; with `true` the incumbent
    /// is cancelled first. Subscriptions already carry their key and are left
    /// unchanged.
    pub fn cancellable(self, key: K, cancel_in_flight: bool) -> Self {
        match self {
            Effect::Task(mut task) => {
                task.cancel_key = Some(key);
                task.cancel_in_flight = cancel_in_flight;
                Effect::Task(task)
            }
            Effect::Merge(children) => Effect::Merge(
                children
                    .into_iter()
                    .map(|c| c.cancellable(key.clone(), cancel_in_flight))
                    .collect(),
            ),
            Effect::Concatenate(children) => Effect::Concatenate(
                children
                    .into_iter()
                    .map(|c| c.cancellable(key.clone(), cancel_in_flight))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Delay every task leaf by `duration` before its body runs; cancelling
    /// during the delay means the body never runs.
    pub fn debounce(self, duration: Duration) -> Self {
        match self {
            Effect::Task(mut task) => {
                task.debounce = Some(duration);
                Effect::Task(task)
            }
            Effect::Merge(children) => {
                Effect::Merge(children.into_iter().map(|c| c.debounce(duration)).collect())
            }
            Effect::Concatenate(children) => Effect::Concatenate(
                children.into_iter().map(|c| c.debounce(duration)).collect(),
            ),
            other => other,
        }
    }

    /// Rate-limit every task leaf: a submission inside the cooldown window is
    /// dropped, not delayed.
    ///
    /// # Panics
    ///
    /// Panics if a task leaf has no cancellation key — the window is tracked
    /// per key, so a keyless throttle is a bug in the calling feature.
    pub fn throttle(self, duration: Duration) -> Self {
        match self {
            Effect::Task(mut task) => {
                assert!(
                    task.cancel_key.is_some(),
                    "throttle requires a cancellation key; call cancellable() first"
                );
                task.throttle = Some(duration);
                Effect::Task(task)
            }
            Effect::Merge(children) => {
                Effect::Merge(children.into_iter().map(|c| c.throttle(duration)).collect())
            }
            Effect::Concatenate(children) => Effect::Concatenate(
                children.into_iter().map(|c| c.throttle(duration)).collect(),
            ),
            other => other,
        }
    }

    /// Attach a priority to every task and fire-and-forget leaf.
    pub fn priority(self, priority: Priority) -> Self {
        match self {
            Effect::Task(mut task) => {
                task.priority = priority;
                Effect::Task(task)
            }
            Effect::FireAndForget(mut fx) => {
                fx.priority = priority;
                Effect::FireAndForget(fx)
            }
            Effect::Merge(children) => {
                Effect::Merge(children.into_iter().map(|c| c.priority(priority)).collect())
            }
            Effect::Concatenate(children) => Effect::Concatenate(
                children.into_iter().map(|c| c.priority(priority)).collect(),
            ),
            other => other,
        }
    }

    /// Recover from body failures by producing a substitute output.
    ///
    /// Applies to every task and subscription leaf. Cancellation is never
    /// routed through the handler.
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(BoxError) -> A + Send + Sync + 'static,
    {
        self.attach_on_error(Arc::new(handler))
    }

    fn attach_on_error(self, handler: ErrorHandler<A>) -> Self {
        match self {
            Effect::Task(mut task) => {
                task.on_error = Some(handler);
                Effect::Task(task)
            }
            Effect::Subscription(mut sub) => {
                sub.on_error = Some(handler);
                Effect::Subscription(sub)
            }
            Effect::Merge(children) => Effect::Merge(
                children
                    .into_iter()
                    .map(|c| c.attach_on_error(handler.clone()))
                    .collect(),
            ),
            Effect::Concatenate(children) => Effect::Concatenate(
                children
                    .into_iter()
                    .map(|c| c.attach_on_error(handler.clone()))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl<A, E, K> Effect<A, E, K> {
    /// Short label used in tracing fields.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Cancel(_) => "cancel",
            Effect::Task(_) => "task",
            Effect::Subscription(_) => "subscription",
            Effect::FireAndForget(_) => "fire_and_forget",
            Effect::Merge(_) => "merge",
            Effect::Concatenate(_) => "concatenate",
        }
    }
}

fn map_effect<A, B, E, K, F>(effect: Effect<A, E, K>, f: F) -> Effect<B, E, K>
where
    A: Send + 'static,
    B: Send + 'static,
    E: Send + Sync + 'static,
    K: CancelKey,
    F: Fn(A) -> B + Send + Sync + Clone + 'static,
{
    match effect {
        Effect::None => Effect::None,
        Effect::Cancel(key) => Effect::Cancel(key),
        Effect::FireAndForget(fx) => Effect::FireAndForget(fx),
        Effect::Task(task) => {
            let TaskEffect {
                priority,
                cancel_key,
                cancel_in_flight,
                debounce,
                throttle,
                body,
                on_error,
            } = task;
            let body_f = f.clone();
            let mapped_body: TaskBody<B, E> = Box::new(move |env| {
                let fut = body(env);
                async move { fut.await.map(body_f) }.boxed()
            });
            let mapped_on_error = on_error.map(|handler| {
                let f = f.clone();
                Arc::new(move |error: BoxError| f(handler(error))) as ErrorHandler<B>
            });
            Effect::Task(TaskEffect {
                priority,
                cancel_key,
                cancel_in_flight,
                debounce,
                throttle,
                body: mapped_body,
                on_error: mapped_on_error,
            })
        }
        Effect::Subscription(sub) => {
            let SubscriptionEffect {
                cancel_key,
                body,
                on_error,
            } = sub;
            let body_f = f.clone();
            let mapped_body: StreamBody<B, E> = Box::new(move |env| {
                body(env)
                    .map(move |item| item.map(body_f.clone()))
                    .boxed()
            });
            let mapped_on_error = on_error.map(|handler| {
                let f = f.clone();
                Arc::new(move |error: BoxError| f(handler(error))) as ErrorHandler<B>
            });
            Effect::Subscription(SubscriptionEffect {
                cancel_key,
                body: mapped_body,
                on_error: mapped_on_error,
            })
        }
        Effect::Merge(children) => Effect::Merge(
            children
                .into_iter()
                .map(|c| map_effect(c, f.clone()))
                .collect(),
        ),
        Effect::Concatenate(children) => Effect::Concatenate(
            children
                .into_iter()
                .map(|c| map_effect(c, f.clone()))
                .collect(),
        ),
    }
}

impl<A, E, K: fmt::Debug> fmt::Debug for Effect<A, E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::None => write!(f, "Effect::None"),
            Effect::Cancel(key) => f.debug_tuple("Effect::Cancel").field(key).finish(),
            Effect::Task(task) => f
                .debug_struct("Effect::Task")
                .field("priority", &task.priority)
                .field("cancel_key", &task.cancel_key)
                .field("cancel_in_flight", &task.cancel_in_flight)
                .field("debounce", &task.debounce)
                .field("throttle", &task.throttle)
                .field("body", &"<closure>")
                .field("on_error", &task.on_error.is_some())
                .finish(),
            Effect::Subscription(sub) => f
                .debug_struct("Effect::Subscription")
                .field("cancel_key", &sub.cancel_key)
                .field("body", &"<closure>")
                .field("on_error", &sub.on_error.is_some())
                .finish(),
            Effect::FireAndForget(fx) => f
                .debug_struct("Effect::FireAndForget")
                .field("priority", &fx.priority)
                .field("body", &"<closure>")
                .finish(),
            Effect::Merge(children) => f.debug_tuple("Effect::Merge").field(children).finish(),
            Effect::Concatenate(children) => {
                f.debug_tuple("Effect::Concatenate").field(children).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestEffect = Effect<i32, (), &'static str>;

    #[test]
    fn merge_of_nothing_collapses_to_none() {
        let effect = TestEffect::merge(vec![]);
        assert!(matches!(effect, Effect::None));
    }

    #[test]
    fn merge_of_one_collapses_to_the_child() {
        let effect = TestEffect::merge(vec![Effect::cancel("fetch")]);
        assert!(matches!(effect, Effect::Cancel("fetch")));
    }

    #[test]
    fn concatenate_collapse_rules() {
        assert!(matches!(TestEffect::concatenate(vec![]), Effect::None));
        let single = TestEffect::concatenate(vec![Effect::task(|_| async { Ok(1) })]);
        assert!(matches!(single, Effect::Task(_)));
        let pair = TestEffect::concatenate(vec![
            Effect::task(|_| async { Ok(1) }),
            Effect::task(|_| async { Ok(2) }),
        ]);
        assert!(matches!(pair, Effect::Concatenate(_)));
    }

    #[tokio::test]
    async fn map_rewrites_the_task_output() {
        let effect: TestEffect = Effect::task(|_| async { Ok(20) });
        let mapped = effect.map(|n| n + 1);
        match mapped {
            Effect::Task(task) => {
                let out = (task.body)(Arc::new(())).await.unwrap();
                assert_eq!(out, 21);
            }
            other => panic!("expected a task, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn map_then_map_composes() {
        let effect: TestEffect = Effect::task(|_| async { Ok(3) });
        let mapped = effect.map(|n| n * 10).map(|n| n + 4);
        match mapped {
            Effect::Task(task) => {
                let out = (task.body)(Arc::new(())).await.unwrap();
                assert_eq!(out, 34);
            }
            other => panic!("expected a task, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn map_rewrites_the_error_handler_too() {
        let effect: TestEffect = Effect::task(|_| async { Err("boom".into()) }).on_error(|_| -1);
        let mapped = effect.map(|n| n * 2);
        match mapped {
            Effect::Task(task) => {
                let error = (task.body)(Arc::new(())).await.unwrap_err();
                let handler = task.on_error.expect("handler survives map");
                assert_eq!(handler(error), -2);
            }
            other => panic!("expected a task, got {:?}", other.kind()),
        }
    }

    #[test]
    #[should_panic(expected = "never produces an output")]
    fn map_on_a_cancel_effect_is_a_contract_violation() {
        let _ = TestEffect::cancel("fetch").map(|n| n);
    }

    #[test]
    fn map_passes_cancel_children_through_compositions() {
        let effect = TestEffect::merge(vec![
            Effect::cancel("fetch"),
            Effect::task(|_| async { Ok(1) }),
        ]);
        let mapped = effect.map(|n| n + 1);
        match mapped {
            Effect::Merge(children) => {
                assert!(matches!(children[0], Effect::Cancel("fetch")));
                assert!(matches!(children[1], Effect::Task(_)));
            }
            other => panic!("expected a merge, got {:?}", other.kind()),
        }
    }

    #[test]
    fn cancellable_rewrites_every_task_leaf() {
        let effect = TestEffect::merge(vec![
            Effect::task(|_| async { Ok(1) }),
            Effect::task(|_| async { Ok(2) }),
        ]);
        match effect.cancellable("shared", true) {
            Effect::Merge(children) => {
                for child in children {
                    match child {
                        Effect::Task(task) => {
                            assert_eq!(task.cancel_key, Some("shared"));
                            assert!(task.cancel_in_flight);
                        }
                        other => panic!("expected a task, got {:?}", other.kind()),
                    }
                }
            }
            other => panic!("expected a merge, got {:?}", other.kind()),
        }
    }

    #[test]
    #[should_panic(expected = "throttle requires a cancellation key")]
    fn throttle_without_a_key_is_a_contract_violation() {
        let _ = TestEffect::task(|_| async { Ok(1) }).throttle(Duration::from_millis(100));
    }

    #[test]
    fn throttle_with_a_key_sets_the_window() {
        let effect = TestEffect::task(|_| async { Ok(1) })
            .cancellable("poll", false)
            .throttle(Duration::from_millis(100));
        match effect {
            Effect::Task(task) => assert_eq!(task.throttle, Some(Duration::from_millis(100))),
            other => panic!("expected a task, got {:?}", other.kind()),
        }
    }

    #[test]
    fn priority_reaches_fire_and_forget_leaves() {
        let effect = TestEffect::merge(vec![
            Effect::fire_and_forget(|_| async { Ok(()) }),
            Effect::task(|_| async { Ok(1) }),
        ])
        .priority(Priority::High);
        match effect {
            Effect::Merge(children) => {
                match &children[0] {
                    Effect::FireAndForget(fx) => assert_eq!(fx.priority, Priority::High),
                    other => panic!("expected fire-and-forget, got {:?}", other.kind()),
                }
                match &children[1] {
                    Effect::Task(task) => assert_eq!(task.priority, Priority::High),
                    other => panic!("expected a task, got {:?}", other.kind()),
                }
            }
            other => panic!("expected a merge, got {:?}", other.kind()),
        }
    }
}
