//! The dispatch runtime: lifecycle, per-update routing, hot-reload.
//!
//! One dedicated task drains the update source strictly sequentially;
//! handlers run inside that turn, so a slow handler stalls everyone. That
//! trade-off is deliberate: a single loop keeps per-user ordering and makes
//! state transitions race-free without per-user executors. Long work belongs
//! off the loop, reporting back through [`crate::resync`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use teloxide::types::UserId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{FsmError, FsmResult};
use crate::sessions::SessionStore;
use crate::state::{normalize_trigger, Handler, Registry, State, StateNode};
use crate::update::{Update, UpdateKind, UpdateSource};

/// Session lifetime when none is configured, mirroring the defaults the
/// dispatcher has always shipped with.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Default interval between session sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Construction inputs for [`Fsm::new`].
#[derive(Clone)]
pub struct Config {
    token: String,
    expiration: Duration,
    cleanup_interval: Duration,
    states: Vec<State>,
    ignore_list: Vec<i64>,
}

impl Config {
    /// Starts a config with the given bot token and default TTLs
    /// (24 h session expiration, hourly sweep).
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expiration: DEFAULT_EXPIRATION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            states: Vec::new(),
            ignore_list: Vec::new(),
        }
    }

    /// How long a user's session entry lives after the last state change.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// How often the background sweep reclaims expired sessions.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Initial state registry. May be empty; `Fsm::replace_states` installs
    /// later generations.
    pub fn states(mut self, states: Vec<State>) -> Self {
        self.states = states;
        self
    }

    /// User or chat ids whose updates are skipped silently.
    pub fn ignore(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.ignore_list.extend(ids);
        self
    }
}

struct FsmInner {
    token: String,
    cleanup_interval: Duration,
    registry: RwLock<Arc<Registry>>,
    sessions: SessionStore,
    ignore_list: Vec<i64>,
    // Optional pre-dispatch hook; frozen once the loop is running.
    update_tap: RwLock<Option<Handler>>,
    running: AtomicBool,
    // Bumped by every `start`; lets an exiting loop tell whether the run
    // flag still belongs to it before releasing it.
    run_seq: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Cheap-to-clone handle to the dispatcher runtime.
///
/// Handlers receive a clone of this on every invocation and use it to read
/// or change the sending user's state, including an immediate re-dispatch
/// of the current update via [`Fsm::set_user_state_immediate`].
#[derive(Clone)]
pub struct Fsm {
    inner: Arc<FsmInner>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm").finish_non_exhaustive()
    }
}

impl Fsm {
    /// Validates the config and builds the runtime (stopped).
    ///
    /// Fails with `InvalidToken` on an empty token, with validation errors
    /// on zero TTLs, and with registry errors on a bad initial state set.
    pub fn new(config: Config) -> FsmResult<Self> {
        if config.token.trim().is_empty() {
            return Err(FsmError::InvalidToken);
        }
        if config.expiration.is_zero() {
            return Err(FsmError::InvalidExpiration(config.expiration));
        }
        if config.cleanup_interval.is_zero() {
            return Err(FsmError::InvalidCleanupInterval(config.cleanup_interval));
        }
        let registry = Registry::new(config.states)?;

        Ok(Self {
            inner: Arc::new(FsmInner {
                token: config.token,
                cleanup_interval: config.cleanup_interval,
                registry: RwLock::new(Arc::new(registry)),
                sessions: SessionStore::new(config.expiration),
                ignore_list: config.ignore_list,
                update_tap: RwLock::new(None),
                running: AtomicBool::new(false),
                run_seq: AtomicU64::new(0),
                cancel: Mutex::new(None),
            }),
        })
    }

    /// The bot token this runtime was constructed with.
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Installs a hook that runs for every inbound update before the
    /// ignore-list filter and any state resolution. Hook errors are logged,
    /// never fatal. Must be called before `start`.
    pub fn set_update_handler(&self, handler: Handler) -> FsmResult<()> {
        if self.is_running() {
            return Err(FsmError::AlreadyRunning);
        }
        *self
            .inner
            .update_tap
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    /// Starts draining `source` on a dedicated task.
    ///
    /// Fails fast with `AlreadyRunning` if the loop is up; never waits for
    /// a previous run to end. The returned join handle resolves when the
    /// loop exits and carries its terminal error: `Ok` on `stop` or source
    /// exhaustion, `Err` on a transport failure.
    pub fn start<S>(&self, source: S) -> FsmResult<JoinHandle<FsmResult<()>>>
    where
        S: UpdateSource + 'static,
    {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("start requested while dispatcher is already running");
            return Err(FsmError::AlreadyRunning);
        }

        let run_id = self.inner.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        self.spawn_sweeper(cancel.child_token());

        log::info!("starting dispatch loop");
        let fsm = self.clone();
        Ok(tokio::spawn(async move {
            let result = fsm.run_loop(source, &cancel).await;
            // Stops the sweeper when the loop ends on its own.
            cancel.cancel();
            // Release the run flag only if no newer run has claimed it.
            if fsm.inner.run_seq.load(Ordering::SeqCst) == run_id {
                fsm.inner.running.store(false, Ordering::SeqCst);
            }
            if let Err(e) = &result {
                log::error!("dispatch loop terminated: {e}");
            } else {
                log::info!("dispatch loop stopped");
            }
            result
        }))
    }

    /// Stops the running loop: cancels the transport receive and the
    /// session sweeper. A handler already executing finishes its turn.
    /// Fails with `NotRunning` if no loop holds the run flag.
    pub fn stop(&self) -> FsmResult<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FsmError::NotRunning);
        }
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
        log::info!("stop requested");
        Ok(())
    }

    /// Atomically replaces the whole state registry with a new generation.
    /// Turns already in flight keep the snapshot they captured; the next
    /// turn sees the new generation in full.
    pub fn replace_states(&self, states: Vec<State>) -> FsmResult<()> {
        let next = Arc::new(Registry::new(states)?);
        let total = next.len();
        let globals = next.globals().len();
        *self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        log::info!("state registry replaced: {total} state(s), {globals} global");
        Ok(())
    }

    /// Assigns `state` as the user's current state, refreshing the session
    /// TTL. Fails with `UnknownState` (and leaves the session untouched)
    /// if the current registry generation has no such state.
    pub fn set_user_state(&self, user: UserId, state: &str) -> FsmResult<()> {
        if self.registry_snapshot().lookup(state).is_none() {
            return Err(FsmError::UnknownState(state.to_string()));
        }
        self.inner.sessions.insert(user, state.to_string());
        Ok(())
    }

    /// The user's current state name, or `NoActiveState` if no live
    /// session entry exists.
    pub fn user_state(&self, user: UserId) -> FsmResult<String> {
        self.inner
            .sessions
            .get(user)
            .ok_or(FsmError::NoActiveState(user))
    }

    /// Changes the user's state and synchronously re-dispatches `update`
    /// against the destination state: runs its entrance handler (if any),
    /// then the full trigger resolution. Errors from either are logged,
    /// not propagated; only the session write (`UnknownState`) can fail.
    ///
    /// This is the one mechanism by which a single inbound update can
    /// traverse two graph nodes in one turn.
    pub async fn set_user_state_immediate(
        &self,
        user: UserId,
        state: &str,
        update: &Update,
    ) -> FsmResult<()> {
        self.set_user_state(user, state)?;

        let registry = self.registry_snapshot();
        // A concurrent replace can race the session write; nothing to
        // re-dispatch against in that case.
        let Some(node) = registry.lookup(state) else {
            return Ok(());
        };

        if let Some(entrance) = &node.at_entrance {
            if let Err(e) = entrance(self.clone(), update.clone()).await {
                log::error!("entrance handler of state {:?} failed for user {}: {e}", state, user);
            }
        }
        if let Err(e) = self.select_handler(node, update).await {
            log::error!("immediate dispatch in state {:?} failed for user {}: {e}", state, user);
        }
        Ok(())
    }

    fn registry_snapshot(&self) -> Arc<Registry> {
        Arc::clone(
            &self
                .inner
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn is_ignored(&self, update: &Update) -> bool {
        let ignore = &self.inner.ignore_list;
        if ignore.contains(&(update.user.0 as i64)) {
            return true;
        }
        matches!(update.chat, Some(chat) if ignore.contains(&chat.0))
    }

    fn spawn_sweeper(&self, cancel: CancellationToken) {
        let fsm = self.clone();
        let interval = self.inner.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; nothing to sweep yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = fsm.inner.sessions.sweep();
                        if removed > 0 {
                            log::debug!("swept {removed} expired session(s)");
                        }
                    }
                }
            }
        });
    }

    async fn run_loop<S: UpdateSource>(
        &self,
        mut source: S,
        cancel: &CancellationToken,
    ) -> FsmResult<()> {
        log::info!("dispatch loop started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = source.recv() => item,
            };
            match item {
                None => {
                    log::info!("update source exhausted");
                    break;
                }
                // Transport failures are the only fatal error class.
                Some(Err(e)) => return Err(e),
                Some(Ok(update)) => self.handle_update(update).await,
            }
        }
        Ok(())
    }

    /// Routes one inbound update: tap, ignore filter, global scan, then
    /// local-state resolution. Handler and lookup failures end this turn
    /// only; the loop always reaches the next update.
    async fn handle_update(&self, update: Update) {
        let tap = self
            .inner
            .update_tap
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tap) = tap {
            if let Err(e) = tap(self.clone(), update.clone()).await {
                log::error!("update tap failed for user {}: {e}", update.user);
            }
        }

        if self.is_ignored(&update) {
            log::debug!("ignoring update from user {}", update.user);
            return;
        }

        // One snapshot per turn: the whole resolution below sees a single
        // registry generation even if a replace lands mid-turn.
        let registry = self.registry_snapshot();

        // First global trigger match wins and fully shadows the local
        // state. A matched handler that fails is logged and the scan moves
        // to the next candidate.
        for node in registry.globals() {
            match self.select_handler(node, &update).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    log::error!("handler in global state {:?} failed for user {}: {e}", node.name, update.user);
                }
            }
        }

        let state_name = match self.inner.sessions.get(update.user) {
            Some(name) => name,
            None => {
                log::info!("no active state for user {}, dropping update", update.user);
                return;
            }
        };
        let Some(node) = registry.lookup(&state_name) else {
            // Session survived a registry replace that removed its state.
            log::error!("session of user {} points at unknown state {:?}, dropping update", update.user, state_name);
            return;
        };
        if let Err(e) = self.select_handler(node, &update).await {
            log::error!("handler in state {:?} failed for user {}: {e}", state_name, update.user);
        }
    }

    /// Resolves `update` against one state. `Ok(true)` means a trigger
    /// matched and its handler succeeded; a matched handler's failure comes
    /// back as `Err`. On a miss the catch-all runs (its failure is only
    /// logged) and the result is `Ok(false)`.
    async fn select_handler(
        &self,
        node: &StateNode,
        update: &Update,
    ) -> Result<bool, crate::errors::HandlerError> {
        match &update.kind {
            UpdateKind::Message(text) => {
                let key = normalize_trigger(text);
                if let Some(h) = node.messages.get(&key) {
                    h(self.clone(), update.clone()).await?;
                    log::info!("message trigger {:?} handled in state {:?} for user {}", key, node.name, update.user);
                    return Ok(true);
                }
                self.run_catch_all(node, update, &key).await;
                Ok(false)
            }
            UpdateKind::Callback(data) => {
                if let Some(h) = node.callbacks.get(data) {
                    h(self.clone(), update.clone()).await?;
                    log::info!("callback {:?} handled in state {:?} for user {}", data, node.name, update.user);
                    return Ok(true);
                }
                self.run_catch_all(node, update, data).await;
                Ok(false)
            }
        }
    }

    async fn run_catch_all(&self, node: &StateNode, update: &Update, key: &str) {
        match &node.catch_all {
            Some(h) => {
                if let Err(e) = h(self.clone(), update.clone()).await {
                    log::error!("catch-all of state {:?} failed for user {}: {e}", node.name, update.user);
                }
            }
            None => {
                log::debug!("no trigger {:?} in state {:?}, dropping update from user {}", key, node.name, update.user);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(Fsm::new(Config::new("")).unwrap_err(), FsmError::InvalidToken));
        assert!(matches!(Fsm::new(Config::new("   ")).unwrap_err(), FsmError::InvalidToken));
    }

    #[test]
    fn zero_ttls_are_rejected() {
        let err = Fsm::new(Config::new("token").expiration(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, FsmError::InvalidExpiration(_)));

        let err = Fsm::new(Config::new("token").cleanup_interval(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, FsmError::InvalidCleanupInterval(_)));
    }

    #[test]
    fn empty_state_registry_is_allowed() {
        let fsm = Fsm::new(Config::new("token")).unwrap();
        assert!(!fsm.is_running());
        assert_eq!(fsm.token(), "token");
    }
}
