//! Finite-state-machine engine with async pre-transition hooks.
//!
//! A model declares its states through [`Stateful::hooks`], a `match` over
//! its state enum returning the per-state [`Hooks`] table. A transition runs:
//!
//! ```text
//! change_state(new)
//!   ├─ new == current        ─► Unchanged
//!   ├─ pre(new) fails        ─► Vetoed (state untouched, logged)
//!   └─ exit(old) ─► state = new ─► enter(new) ─► listeners(new)
//!                                     │
//!                                     └─ Some(next) ─► change_state(next)
//! ```
//!
//! An enter hook may name a follow-up state; the engine chains into it after
//! the current state's listeners have fired, without recursion.
//!
//! Hooks and listeners run on the caller's task. The model is borrowed
//! mutably for the whole transition, so no two transitions interleave.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Async gate run before entering a state. `Err` vetoes the transition.
pub type PreHook<M> = for<'a> fn(&'a mut M) -> BoxFuture<'a, Result<()>>;

/// Action run on entering a state. May return a state to chain into.
pub type EnterHook<M> =
    for<'a> fn(&'a mut M) -> BoxFuture<'a, Option<<M as Stateful>::State>>;

/// Action run on leaving a state.
pub type ExitHook<M> = fn(&mut M);

/// External observer of a state, invoked each time the state is entered.
pub type Listener<M> = Box<dyn FnMut(&M) + Send>;

/// Hooks declared for one state.
pub struct Hooks<M: Stateful> {
    pub pre: Option<PreHook<M>>,
    pub enter: Option<EnterHook<M>>,
    pub exit: Option<ExitHook<M>>,
}

impl<M: Stateful> Hooks<M> {
    /// A declared state with no hooks.
    pub fn none() -> Self {
        Self {
            pre: None,
            enter: None,
            exit: None,
        }
    }

    pub fn pre(mut self, hook: PreHook<M>) -> Self {
        self.pre = Some(hook);
        self
    }

    pub fn enter(mut self, hook: EnterHook<M>) -> Self {
        self.enter = Some(hook);
        self
    }

    pub fn exit(mut self, hook: ExitHook<M>) -> Self {
        self.exit = Some(hook);
        self
    }
}

/// A model driven by a [`StateMachine`].
pub trait Stateful: Sized + Send {
    type State: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn machine(&self) -> &StateMachine<Self>;

    fn machine_mut(&mut self) -> &mut StateMachine<Self>;

    /// The hook table for `state`, or `None` if the state is undeclared.
    fn hooks(state: Self::State) -> Option<Hooks<Self>>;

    /// Whether `from -> to` is a legal edge. Defaults to any declared pair.
    fn permits(_from: Self::State, _to: Self::State) -> bool {
        true
    }

    /// Called after the state field changes, before the enter hook.
    fn on_transition(&mut self, _from: Self::State, _to: Self::State) {}
}

/// What a call to [`change_state`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Target equals the current state.
    Unchanged,
    /// A pre hook refused the transition.
    Vetoed,
    /// The state changed (possibly through chained states).
    Changed,
}

/// Current state plus listeners registered through [`StateMachine::bind`].
pub struct StateMachine<M: Stateful> {
    state: M::State,
    listeners: HashMap<M::State, Vec<Listener<M>>>,
}

impl<M: Stateful> StateMachine<M> {
    pub fn new(initial: M::State) -> Self {
        Self {
            state: initial,
            listeners: HashMap::new(),
        }
    }

    pub fn state(&self) -> M::State {
        self.state
    }

    /// Register `listener` to run every time `state` is entered, after the
    /// state's own enter hook. Listeners run in registration order.
    pub fn bind(&mut self, state: M::State, listener: impl FnMut(&M) + Send + 'static) {
        self.listeners
            .entry(state)
            .or_default()
            .push(Box::new(listener));
    }
}

/// Move `model` to `target`, running hooks and listeners.
///
/// # Errors
///
/// Returns [`Error::UndeclaredState`] if a target state has no hook table and
/// [`Error::InvalidTransition`] if [`Stateful::permits`] rejects an edge.
/// Both are programming errors in the model.
pub async fn change_state<M: Stateful>(model: &mut M, target: M::State) -> Result<Transition> {
    let mut next = target;
    let mut outcome = Transition::Unchanged;

    loop {
        let current = model.machine().state;
        debug!(from = ?current, to = ?next, "changing state");

        if current == next {
            return Ok(outcome);
        }

        let hooks = M::hooks(next).ok_or_else(|| Error::UndeclaredState(format!("{next:?}")))?;
        if !M::permits(current, next) {
            return Err(Error::InvalidTransition {
                from: format!("{current:?}"),
                to: format!("{next:?}"),
            });
        }

        if let Some(pre) = hooks.pre {
            if let Err(e) = pre(model).await {
                warn!(from = ?current, to = ?next, error = %e, "state change aborted, pre hook failed");
                return Ok(match outcome {
                    Transition::Changed => Transition::Changed,
                    _ => Transition::Vetoed,
                });
            }
        }

        if let Some(exit) = M::hooks(current).and_then(|h| h.exit) {
            exit(model);
        }

        model.machine_mut().state = next;
        model.on_transition(current, next);
        outcome = Transition::Changed;

        let follow_up = match hooks.enter {
            Some(enter) => enter(model).await,
            None => None,
        };

        fire_listeners(model, next);

        match follow_up {
            Some(state) => next = state,
            None => return Ok(outcome),
        }
    }
}

fn fire_listeners<M: Stateful>(model: &mut M, state: M::State) {
    let Some(mut listeners) = model.machine_mut().listeners.remove(&state) else {
        return;
    };

    for listener in listeners.iter_mut() {
        listener(&*model);
    }

    // Listeners bound while these ran go after the existing ones.
    let slot = model.machine_mut().listeners.entry(state).or_default();
    let added = std::mem::replace(slot, listeners);
    slot.extend(added);
}
