//! tgfsm - finite-state dialogue dispatcher for Telegram bots.
//!
//! The crate routes an inbound update stream through a registry of named
//! dialogue states. Each state owns its message and callback triggers;
//! global states are checked for every update before the sending user's
//! local state. Per-user sessions carry the current state name with a TTL,
//! the whole registry is hot-swappable at runtime, and a handler can move
//! the user and re-dispatch the current update in one turn.
//!
//! # Module Structure
//!
//! - `state`: state builder, handler type, validated registry
//! - `sessions`: per-user current-state store with TTL
//! - `dispatcher`: the runtime — lifecycle, update loop, hot-reload
//! - `update`: event model and the `UpdateSource` transport seam
//! - `telegram`: `getUpdates` long-polling transport
//! - `resync`: coalescing notification for an external reconciliation loop
//!
//! ```no_run
//! use tgfsm::{handler, Config, Fsm, State, TelegramPoller};
//!
//! # async fn run() -> tgfsm::FsmResult<()> {
//! let start = State::new("start").global().on_message(
//!     "/start",
//!     handler(|fsm, update| async move {
//!         fsm.set_user_state_immediate(update.user, "name_enter", &update).await?;
//!         Ok(())
//!     }),
//! );
//! let name_enter = State::new("name_enter").catch_all(handler(|_fsm, update| async move {
//!     log::info!("got a name: {:?}", update.kind);
//!     Ok(())
//! }));
//!
//! let token = std::env::var("BOT_TOKEN").unwrap_or_default();
//! let fsm = Fsm::new(Config::new(&token).states(vec![start, name_enter]))?;
//! let loop_done = fsm.start(TelegramPoller::new(fsm.token()))?;
//! loop_done.await.expect("dispatch task panicked")?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod errors;
pub mod resync;
mod sessions;
pub mod state;
pub mod telegram;
pub mod update;

// Re-export commonly used types for convenience
pub use dispatcher::{Config, Fsm, DEFAULT_CLEANUP_INTERVAL, DEFAULT_EXPIRATION};
pub use errors::{FsmError, FsmResult, HandlerError};
pub use resync::{resync_channel, ResyncSignal};
pub use state::{handler, Handler, State};
pub use telegram::TelegramPoller;
pub use update::{Update, UpdateKind, UpdateSource};
