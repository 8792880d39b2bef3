//! Dialogue states, their handlers, and the validated state registry.
//!
//! A [`State`] is built with a fluent builder and handed to the dispatcher
//! (initially through `Config`, later through `Fsm::replace_states`). Each
//! batch of states is compiled into one immutable [`Registry`] generation;
//! mutating a registered state is not a thing — register a new generation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::dispatcher::Fsm;
use crate::errors::{FsmError, FsmResult, HandlerError};
use crate::update::Update;

/// An opaque unit of behavior bound to one trigger.
///
/// Handlers receive a cheap clone of the [`Fsm`] handle so they can call
/// back into the runtime (change the user's state, trigger an immediate
/// re-dispatch) and the update that fired them. The dispatcher only
/// consumes success/failure.
pub type Handler =
    Arc<dyn Fn(Fsm, Update) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
///
/// ```no_run
/// use tgfsm::{handler, Handler};
///
/// let echo: Handler = handler(|_fsm, update| async move {
///     log::info!("got {:?}", update.kind);
///     Ok(())
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Fsm, Update) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |fsm, update| Box::pin(f(fsm, update)))
}

/// A named node in the dialogue graph.
///
/// Trigger keys are collected as written; normalization and uniqueness
/// checks happen when the batch is compiled into a [`Registry`], so a bad
/// key set fails the registration call instead of silently shadowing.
#[derive(Clone)]
pub struct State {
    pub(crate) name: String,
    pub(crate) global: bool,
    message_triggers: Vec<(String, Handler)>,
    callback_triggers: Vec<(String, Handler)>,
    at_entrance: Option<Handler>,
    catch_all: Option<Handler>,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: false,
            message_triggers: Vec::new(),
            callback_triggers: Vec::new(),
            at_entrance: None,
            catch_all: None,
        }
    }

    /// Marks this state global: its triggers are checked for every update,
    /// before any local-state lookup.
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Binds a handler to a free-text trigger. The key is normalized
    /// (trim + lowercase) at registry build time.
    pub fn on_message(mut self, key: impl Into<String>, handler: Handler) -> Self {
        self.message_triggers.push((key.into(), handler));
        self
    }

    /// Binds a handler to an exact callback payload.
    pub fn on_callback(mut self, key: impl Into<String>, handler: Handler) -> Self {
        self.callback_triggers.push((key.into(), handler));
        self
    }

    /// Handler invoked when a user is transitioned into this state via
    /// `set_user_state_immediate` (not on a bare session write).
    pub fn at_entrance(mut self, handler: Handler) -> Self {
        self.at_entrance = Some(handler);
        self
    }

    /// Fallback invoked when an update matches none of this state's
    /// triggers. Without it, unmatched input is logged and dropped.
    pub fn catch_all(mut self, handler: Handler) -> Self {
        self.catch_all = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Message triggers are matched case-insensitively with surrounding
/// whitespace stripped.
pub(crate) fn normalize_trigger(key: &str) -> String {
    key.trim().to_lowercase()
}

/// One compiled state: trigger maps ready for lookup.
pub(crate) struct StateNode {
    pub(crate) name: String,
    pub(crate) messages: HashMap<String, Handler>,
    pub(crate) callbacks: HashMap<String, Handler>,
    pub(crate) at_entrance: Option<Handler>,
    pub(crate) catch_all: Option<Handler>,
}

/// An immutable-per-generation mapping from state name to compiled state,
/// plus the global subset.
///
/// The global subset is ordered lexicographically by state name. The order
/// is observable (the scan runs first-match-wins), so it must be stable
/// across registrations rather than inherited from map iteration.
pub(crate) struct Registry {
    states: HashMap<String, Arc<StateNode>>,
    globals: Vec<Arc<StateNode>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Compiles a batch of states into one generation.
    ///
    /// Rejects duplicate state names and duplicate trigger keys (after
    /// normalization for message triggers) within one state.
    pub(crate) fn new(states: Vec<State>) -> FsmResult<Self> {
        let mut compiled: HashMap<String, Arc<StateNode>> = HashMap::with_capacity(states.len());
        let mut globals: Vec<Arc<StateNode>> = Vec::new();

        for state in states {
            let State {
                name,
                global,
                message_triggers,
                callback_triggers,
                at_entrance,
                catch_all,
            } = state;

            let mut messages = HashMap::with_capacity(message_triggers.len());
            for (key, handler) in message_triggers {
                let key = normalize_trigger(&key);
                if messages.insert(key.clone(), handler).is_some() {
                    return Err(FsmError::DuplicateTrigger {
                        state: name,
                        kind: "message",
                        key,
                    });
                }
            }

            let mut callbacks = HashMap::with_capacity(callback_triggers.len());
            for (key, handler) in callback_triggers {
                if callbacks.insert(key.clone(), handler).is_some() {
                    return Err(FsmError::DuplicateTrigger {
                        state: name,
                        kind: "callback",
                        key,
                    });
                }
            }

            let node = Arc::new(StateNode {
                name: name.clone(),
                messages,
                callbacks,
                at_entrance,
                catch_all,
            });

            if global {
                globals.push(Arc::clone(&node));
            }
            if compiled.insert(name.clone(), node).is_some() {
                return Err(FsmError::DuplicateState(name));
            }
        }

        globals.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            states: compiled,
            globals,
        })
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Arc<StateNode>> {
        self.states.get(name)
    }

    pub(crate) fn globals(&self) -> &[Arc<StateNode>] {
        &self.globals
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        handler(|_, _| async { Ok(()) })
    }

    #[test]
    fn normalizes_message_triggers() {
        assert_eq!(normalize_trigger("  /Start "), "/start");
        assert_eq!(normalize_trigger("Black Cat Pub"), "black cat pub");
    }

    #[test]
    fn rejects_duplicate_message_trigger_after_normalization() {
        let state = State::new("s")
            .on_message("/start", noop())
            .on_message(" /START ", noop());
        let err = Registry::new(vec![state]).unwrap_err();
        match err {
            FsmError::DuplicateTrigger { state, kind, key } => {
                assert_eq!(state, "s");
                assert_eq!(kind, "message");
                assert_eq!(key, "/start");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn callback_triggers_are_matched_exactly_not_normalized() {
        let state = State::new("s")
            .on_callback("Yes", noop())
            .on_callback("yes", noop());
        let registry = Registry::new(vec![state]).unwrap();
        let node = registry.lookup("s").unwrap();
        assert!(node.callbacks.contains_key("Yes"));
        assert!(node.callbacks.contains_key("yes"));
    }

    #[test]
    fn rejects_duplicate_state_name() {
        let err = Registry::new(vec![State::new("s"), State::new("s")]).unwrap_err();
        assert!(matches!(err, FsmError::DuplicateState(name) if name == "s"));
    }

    #[test]
    fn globals_are_sorted_by_name() {
        let registry = Registry::new(vec![
            State::new("zulu").global(),
            State::new("local"),
            State::new("alpha").global(),
        ])
        .unwrap();
        let order: Vec<&str> = registry.globals().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["alpha", "zulu"]);
        assert_eq!(registry.len(), 3);
    }
}
