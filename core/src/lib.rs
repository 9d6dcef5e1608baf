//! # Stockpay Core
//!
//! Reducer, effect and environment abstractions shared by the stockpay engine.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one aggregate (an intent, a basket, ...)
//! - **Action**: All inputs to a reducer (commands, events, effect feedback)
//! - **Reducer**: Pure function `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions, executed by the caller
//! - **Environment**: Injected dependencies via traits
//!
//! Reducers never perform I/O themselves. They describe it as [`effect::Effect`]
//! values; the caller decides when to run them (see [`executor`]) and feeds the
//! resulting actions back into the reducer.
//!
//! ## Example
//!
//! ```ignore
//! use stockpay_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! impl Reducer for IntentReducer {
//!     type State = IntentState;
//!     type Action = IntentAction;
//!     type Environment = IntentEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut IntentState,
//!         action: IntentAction,
//!         env: &IntentEnvironment,
//!     ) -> SmallVec<[Effect<IntentAction>; 4]> {
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Validates the action, updates state in place, and returns the
        /// effects to run. Most reducers return zero to two effects, so the
        /// result is stored inline.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values, not execution. They compose with [`Effect::merge`] and
/// [`Effect::chain`] and are run by [`crate::executor`].
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (for timeouts, retries)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Wrap a future producing an optional feedback action
        #[must_use]
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }

        /// Returns `true` for [`Effect::None`]
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// In-process effect execution
///
/// Runs effect trees to completion on the current task and hands back the
/// feedback actions, so the caller can apply them while it still owns the
/// state lock that guarded the original transition.
pub mod executor {
    use super::effect::Effect;
    use futures::future::{BoxFuture, join_all};

    /// Run one effect to completion and collect the actions it produced.
    ///
    /// `Sequential` children run in order; `Parallel` children run
    /// concurrently and their actions are returned in declaration order.
    pub fn run<A>(effect: Effect<A>) -> BoxFuture<'static, Vec<A>>
    where
        A: Send + 'static,
    {
        Box::pin(async move {
            match effect {
                Effect::None => Vec::new(),
                Effect::Future(fut) => fut.await.into_iter().collect(),
                Effect::Delay { duration, action } => {
                    tokio::time::sleep(duration).await;
                    vec![*action]
                },
                Effect::Parallel(effects) => join_all(effects.into_iter().map(run))
                    .await
                    .into_iter()
                    .flatten()
                    .collect(),
                Effect::Sequential(effects) => {
                    let mut actions = Vec::new();
                    for effect in effects {
                        actions.extend(run(effect).await);
                    }
                    actions
                },
            }
        })
    }

    /// Run every effect returned by a reducer, in order.
    pub async fn run_all<A, I>(effects: I) -> Vec<A>
    where
        A: Send + 'static,
        I: IntoIterator<Item = Effect<A>>,
    {
        let mut actions = Vec::new();
        for effect in effects {
            if effect.is_none() {
                continue;
            }
            actions.extend(run(effect).await);
        }
        actions
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::executor;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Step {
        First,
        Second,
        Late,
    }

    #[tokio::test]
    async fn sequential_effects_preserve_order() {
        let effect = Effect::chain(vec![
            Effect::future(async { Some(Step::First) }),
            Effect::None,
            Effect::future(async { Some(Step::Second) }),
        ]);

        assert_eq!(executor::run(effect).await, vec![Step::First, Step::Second]);
    }

    #[tokio::test]
    async fn parallel_effects_collect_every_action() {
        let effect = Effect::merge(vec![
            Effect::Delay {
                duration: Duration::from_millis(5),
                action: Box::new(Step::Late),
            },
            Effect::future(async { Some(Step::First) }),
            Effect::future(async { None }),
        ]);

        let actions = executor::run(effect).await;
        assert_eq!(actions, vec![Step::Late, Step::First]);
    }

    #[tokio::test]
    async fn run_all_skips_none() {
        let actions =
            executor::run_all(vec![Effect::None, Effect::future(async { Some(Step::Second) })])
                .await;
        assert_eq!(actions, vec![Step::Second]);
    }

    #[test]
    fn debug_hides_future_body() {
        let effect: Effect<Step> = Effect::future(async { None });
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }
}
