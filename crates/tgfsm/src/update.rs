//! Inbound event model and the transport seam.
//!
//! The dispatcher never talks to Telegram directly; it drains any
//! [`UpdateSource`] one item at a time. The long-polling implementation
//! lives in [`crate::telegram`]; tests feed updates through a plain
//! tokio mpsc channel.

use async_trait::async_trait;
use teloxide::types::{ChatId, UserId};
use tokio::sync::mpsc;

use crate::errors::FsmResult;

/// One inbound event from the chat platform, reduced to what the state
/// machine can route on: who sent it and exactly one trigger payload.
#[derive(Debug, Clone)]
pub struct Update {
    /// Sender identity. Updates without a sender are dropped at the
    /// transport edge; the dispatcher cannot route them.
    pub user: UserId,
    /// Chat the update arrived in, when the platform reports one.
    pub chat: Option<ChatId>,
    pub kind: UpdateKind,
}

/// The trigger payload carried by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// Free-text message; matched against a state's message triggers
    /// after normalization (trim + lowercase).
    Message(String),
    /// Opaque callback payload from a button press; matched exactly.
    Callback(String),
}

impl Update {
    /// Shorthand for a text-message update.
    pub fn message(user: UserId, chat: ChatId, text: impl Into<String>) -> Self {
        Self {
            user,
            chat: Some(chat),
            kind: UpdateKind::Message(text.into()),
        }
    }

    /// Shorthand for a callback-query update.
    pub fn callback(user: UserId, chat: Option<ChatId>, data: impl Into<String>) -> Self {
        Self {
            user,
            chat,
            kind: UpdateKind::Callback(data.into()),
        }
    }
}

/// A sequentially-consumable stream of inbound updates.
///
/// The dispatcher owns the source exclusively while running and pulls one
/// item per loop turn. `None` means the source is exhausted and ends the
/// loop cleanly; an `Err` item is a transport failure and terminates the
/// loop with that error.
#[async_trait]
pub trait UpdateSource: Send {
    async fn recv(&mut self) -> Option<FsmResult<Update>>;
}

/// Channel-backed source: lets tests and embedding code inject updates
/// (and transport failures) directly.
#[async_trait]
impl UpdateSource for mpsc::Receiver<FsmResult<Update>> {
    async fn recv(&mut self) -> Option<FsmResult<Update>> {
        mpsc::Receiver::recv(self).await
    }
}
