//! Telegram long-polling transport.
//!
//! Pulls `getUpdates` batches through a [`teloxide::Bot`] and feeds them to
//! the dispatcher as [`Update`]s. Only text messages and callback queries
//! with a known sender can be routed by the state machine; everything else
//! is skipped, but still advances the polling offset so it is not fetched
//! again.

use std::collections::VecDeque;

use async_trait::async_trait;
use teloxide::payloads::GetUpdatesSetters as _;
use teloxide::requests::Requester;
use teloxide::types::{MaybeInaccessibleMessage, Update as TgUpdate, UpdateKind as TgUpdateKind};
use teloxide::Bot;

use crate::errors::{FsmError, FsmResult};
use crate::update::{Update, UpdateKind, UpdateSource};

/// Long-poll wait, in seconds. Telegram holds the request open up to this
/// long when no updates are pending.
const POLL_TIMEOUT_SECS: u32 = 25;

/// [`UpdateSource`] over the Telegram Bot API `getUpdates` long poll.
pub struct TelegramPoller {
    bot: Bot,
    offset: i32,
    pending: VecDeque<Update>,
}

impl TelegramPoller {
    pub fn new(token: &str) -> Self {
        Self::with_bot(Bot::new(token))
    }

    /// Builds a poller over an existing `Bot`, e.g. one sharing a reqwest
    /// client with the outbound sender.
    pub fn with_bot(bot: Bot) -> Self {
        Self {
            bot,
            offset: 0,
            pending: VecDeque::new(),
        }
    }

    async fn fetch_batch(&mut self) -> FsmResult<()> {
        let batch = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(POLL_TIMEOUT_SECS)
            .await
            .map_err(|e| FsmError::Transport(e.to_string()))?;

        for raw in batch {
            let next = raw.id.0 as i32 + 1;
            if next > self.offset {
                self.offset = next;
            }
            match convert(raw) {
                Some(update) => self.pending.push_back(update),
                None => log::debug!("skipping update the state machine cannot route"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateSource for TelegramPoller {
    async fn recv(&mut self) -> Option<FsmResult<Update>> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(Ok(update));
            }
            if let Err(e) = self.fetch_batch().await {
                return Some(Err(e));
            }
        }
    }
}

/// Reduces a raw Telegram update to the dispatcher's event model. `None`
/// for anything without a sender or without exactly one routable payload.
fn convert(raw: TgUpdate) -> Option<Update> {
    match raw.kind {
        TgUpdateKind::Message(message) => {
            let user = message.from.as_ref()?.id;
            let text = message.text()?.to_owned();
            Some(Update {
                user,
                chat: Some(message.chat.id),
                kind: UpdateKind::Message(text),
            })
        }
        TgUpdateKind::CallbackQuery(query) => {
            let chat = query.message.as_ref().map(|m| match m {
                MaybeInaccessibleMessage::Regular(msg) => msg.chat.id,
                MaybeInaccessibleMessage::Inaccessible(msg) => msg.chat.id,
            });
            let user = query.from.id;
            let data = query.data?;
            Some(Update {
                user,
                chat,
                kind: UpdateKind::Callback(data),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::{ChatId, UserId};

    #[test]
    fn converts_text_message() {
        let raw: TgUpdate = serde_json::from_str(
            r#"{
                "update_id": 1,
                "message": {
                    "message_id": 100,
                    "date": 1700000000,
                    "chat": {"id": 10, "type": "private", "first_name": "A"},
                    "from": {"id": 7, "is_bot": false, "first_name": "A"},
                    "text": "/start"
                }
            }"#,
        )
        .unwrap();

        let update = convert(raw).unwrap();
        assert_eq!(update.user, UserId(7));
        assert_eq!(update.chat, Some(ChatId(10)));
        assert_eq!(update.kind, UpdateKind::Message("/start".to_string()));
    }

    #[test]
    fn converts_callback_query() {
        let raw: TgUpdate = serde_json::from_str(
            r#"{
                "update_id": 2,
                "callback_query": {
                    "id": "42",
                    "chat_instance": "ci",
                    "from": {"id": 7, "is_bot": false, "first_name": "A"},
                    "data": "bar:black_cat"
                }
            }"#,
        )
        .unwrap();

        let update = convert(raw).unwrap();
        assert_eq!(update.user, UserId(7));
        assert_eq!(update.chat, None);
        assert_eq!(update.kind, UpdateKind::Callback("bar:black_cat".to_string()));
    }

    #[test]
    fn skips_message_without_text() {
        // Service message (new chat member): carries no routable payload.
        let raw: TgUpdate = serde_json::from_str(
            r#"{
                "update_id": 3,
                "message": {
                    "message_id": 101,
                    "date": 1700000000,
                    "chat": {"id": 10, "type": "group", "title": "g"},
                    "from": {"id": 7, "is_bot": false, "first_name": "A"},
                    "new_chat_members": [{"id": 8, "is_bot": false, "first_name": "B"}]
                }
            }"#,
        )
        .unwrap();

        assert!(convert(raw).is_none());
    }
}
