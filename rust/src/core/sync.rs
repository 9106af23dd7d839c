use super::*;

use crate::backend::{with_deadline, BackendError};
use crate::model::Message;
use crate::updates::FetchOrigin;

impl AppCore {
    pub(super) fn refresh_conversations(&mut self) {
        let Some(user_id) = self.user_id.clone() else {
            tracing::debug!("directory: no user, skipping refresh");
            return;
        };
        if self.set_busy(|b| b.loading_conversations = true) {
            self.emit_state();
        }

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        let deadline = self.config.request_timeout();
        self.runtime.spawn(async move {
            let result = with_deadline(deadline, backend.list_conversations(&user_id))
                .await
                .map(|list| list.into_iter().map(Conversation::from).collect());
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ConversationsFetched { user_id, result },
            )));
        });
    }

    pub(super) fn handle_conversations_fetched(
        &mut self,
        user_id: String,
        result: Result<Vec<Conversation>, BackendError>,
    ) {
        if self.user_id.as_deref() != Some(user_id.as_str()) {
            tracing::debug!(%user_id, "directory: result for previous user dropped");
            return;
        }
        self.set_busy(|b| b.loading_conversations = false);
        match result {
            Ok(conversations) => {
                tracing::info!(count = conversations.len(), "directory: loaded");
                self.conversations = conversations;
                self.refresh_directory();
                // Peer label may have just become known.
                if self.state.current_chat.is_some() {
                    self.refresh_current_chat();
                }
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "directory: fetch failed");
                self.conversations.clear();
                self.refresh_directory();
                self.toast("Couldn't load conversations");
            }
        }
    }

    pub(super) fn open_conversation(&mut self, chat_id: String) {
        if self.user_id.is_none() {
            tracing::warn!(%chat_id, "open: no user set");
            return;
        }
        let chat_id = chat_id.trim().to_string();
        if chat_id.is_empty() {
            return;
        }

        self.viewport.reset(&chat_id);
        let generation =
            self.poller
                .activate(self.runtime.handle(), &chat_id, self.core_sender.clone());
        self.set_busy(|b| b.loading_messages = true);
        self.refresh_current_chat();
        self.emit_state();

        self.spawn_fetch_messages(chat_id, FetchOrigin::Load { generation });
    }

    pub(super) fn close_conversation(&mut self) {
        let closed = self.poller.deactivate();
        self.viewport.clear();
        self.set_busy(|b| b.loading_messages = false);
        self.state.current_chat = None;
        if closed.is_some() {
            self.emit_state();
        }
    }

    /// Out-of-band fetch for the active conversation; the poll timer is untouched.
    pub(super) fn refresh_messages(&mut self) {
        let (Some(chat_id), Some(generation)) =
            (self.active_chat_id(), self.poller.current_generation())
        else {
            tracing::debug!("refresh: no active conversation");
            return;
        };
        self.spawn_fetch_messages(chat_id, FetchOrigin::Refresh { generation });
    }

    pub(super) fn handle_poll_tick(&mut self, chat_id: String, generation: u64) {
        if !self.poller.begin_fetch(&chat_id, generation) {
            tracing::debug!(%chat_id, generation, "poll: tick skipped");
            return;
        }
        self.spawn_fetch_messages(chat_id, FetchOrigin::Poll { generation });
    }

    fn spawn_fetch_messages(&self, chat_id: String, origin: FetchOrigin) {
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        let deadline = self.config.request_timeout();
        self.runtime.spawn(async move {
            let result = with_deadline(deadline, backend.list_messages(&chat_id))
                .await
                .map(|list| list.into_iter().map(Message::from).collect());
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::MessagesFetched {
                chat_id,
                origin,
                result,
            })));
        });
    }

    pub(super) fn handle_messages_fetched(
        &mut self,
        chat_id: String,
        origin: FetchOrigin,
        result: Result<Vec<Message>, BackendError>,
    ) {
        if let FetchOrigin::Poll { generation } = origin {
            self.poller.end_fetch(generation);
        }
        if !self.poller.is_current(&chat_id, origin.generation()) {
            tracing::debug!(%chat_id, ?origin, "sync: stale result dropped");
            return;
        }
        let busy_changed = match origin {
            FetchOrigin::Load { .. } => self.set_busy(|b| b.loading_messages = false),
            FetchOrigin::Poll { .. } | FetchOrigin::Refresh { .. } => false,
        };

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                // Next tick retries; no backoff.
                if e.is_transient() {
                    tracing::info!(%chat_id, ?origin, error = %e, "sync: fetch failed");
                } else {
                    tracing::warn!(%chat_id, ?origin, error = %e, "sync: fetch failed");
                }
                if matches!(origin, FetchOrigin::Load { .. }) {
                    self.toast("Couldn't load messages");
                } else if busy_changed {
                    self.emit_state();
                }
                return;
            }
        };

        match origin {
            FetchOrigin::Load { .. } => {
                let before = self.store.len(&chat_id);
                let loaded = self.store.load(&chat_id, messages);
                tracing::info!(%chat_id, count = loaded.len(), "sync: loaded");
                self.after_chat_mutation(&chat_id, loaded.len().saturating_sub(before));
            }
            FetchOrigin::Poll { .. } | FetchOrigin::Refresh { .. } => {
                let outcome = self.store.merge_incoming(&chat_id, messages);
                if !outcome.changed() {
                    if busy_changed {
                        self.emit_state();
                    }
                    return;
                }
                tracing::debug!(
                    %chat_id,
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    reconciled = outcome.reconciled,
                    "sync: merged"
                );
                self.after_chat_mutation(&chat_id, outcome.inserted);
            }
        }
    }
}
