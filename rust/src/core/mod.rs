pub(crate) mod config;
mod directory;
mod polling;
mod send;
mod store;
mod sync;
mod uploads;
mod viewport;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use flume::Sender;
use tokio::sync::Semaphore;

use crate::actions::AppAction;
use crate::backend::ChatBackend;
use crate::model::Conversation;
use crate::state::{AppState, BusyState, ChatMessage, ChatViewState};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use polling::PollScheduler;
use store::MessageStore;
use uploads::UploadBatch;
use viewport::{FollowDecision, ViewportController};

pub use viewport::should_auto_follow;

const TOAST_DISMISS_AFTER: Duration = Duration::from_secs(3);

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,
    backend: Arc<dyn ChatBackend>,

    user_id: Option<String>,
    // Raw directory listing; `state.conversations` is derived from it.
    conversations: Vec<Conversation>,
    store: MessageStore,
    poller: PollScheduler,
    viewport: ViewportController,

    upload_permits: Arc<Semaphore>,
    pending_uploads: HashMap<String, UploadBatch>, // local_id -> batch

    toast_dismiss_token: u64,
    // Bumped on every session teardown; send results from an older session are dropped.
    session: u64,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        shared_state: Arc<RwLock<AppState>>,
        config: config::AppConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("chatsync-io")
            .enable_all()
            .build()
            .context("build tokio runtime")?;

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            poller: PollScheduler::new(config.poll_interval()),
            viewport: ViewportController::new(config.auto_follow_threshold_px()),
            upload_permits: Arc::new(Semaphore::new(config.max_concurrent_uploads())),
            config,
            runtime,
            backend,
            user_id: None,
            conversations: vec![],
            store: MessageStore::new(),
            pending_uploads: HashMap::new(),
            toast_dismiss_token: 0,
            session: 0,
        };

        // Make sure state() has a snapshot before the first action lands.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        Ok(this)
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_scroll_to_newest(&mut self, chat_id: &str) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::ScrollToNewest {
            rev,
            chat_id: chat_id.to_string(),
        });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        self.set_toast(msg);
        self.emit_state();
    }

    /// Like `toast`, but leaves emitting to the caller.
    fn set_toast(&mut self, msg: impl Into<String>) {
        self.state.toast = Some(msg.into());
        self.toast_dismiss_token = self.toast_dismiss_token.saturating_add(1);
        self.schedule_toast_auto_dismiss(self.toast_dismiss_token);
    }

    fn schedule_toast_auto_dismiss(&self, token: u64) {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(TOAST_DISMISS_AFTER).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ToastAutoDismiss { token },
            )));
        });
    }

    fn set_busy(&mut self, f: impl FnOnce(&mut BusyState)) -> bool {
        let mut next = self.state.busy.clone();
        f(&mut next);
        if next == self.state.busy {
            return false;
        }
        self.state.busy = next;
        true
    }

    fn active_chat_id(&self) -> Option<String> {
        self.poller.active_chat_id().map(str::to_string)
    }

    /// Rebuild `state.current_chat` from the store.
    fn refresh_current_chat(&mut self) {
        let Some(chat_id) = self.active_chat_id() else {
            self.state.current_chat = None;
            return;
        };
        let user_id = self.user_id.as_deref().unwrap_or_default();
        let messages = self
            .store
            .messages(&chat_id)
            .iter()
            .map(|m| ChatMessage::from_message(m, user_id))
            .collect();
        let peer_label = self
            .conversations
            .iter()
            .find(|c| c.id == chat_id)
            .map(|c| directory::peer_label(c, user_id))
            .unwrap_or_else(|| chat_id.clone());
        self.state.current_chat = Some(ChatViewState {
            chat_id,
            peer_label,
            messages,
            auto_follow: self.viewport.auto_follow(),
            new_message_count: self.viewport.unseen(),
        });
    }

    /// Rebuild `state.conversations` from the last listing plus local sends.
    fn refresh_directory(&mut self) {
        let Some(user_id) = self.user_id.as_deref() else {
            self.state.conversations = vec![];
            return;
        };
        let store = &self.store;
        self.state.conversations =
            directory::summarize(&self.conversations, user_id, chrono::Utc::now(), |id| {
                store.newest(id)
            });
    }

    /// Publish a store mutation on `chat_id` and let the viewport react to it.
    fn after_chat_mutation(&mut self, chat_id: &str, inserted: usize) {
        self.refresh_directory();
        if self.poller.active_chat_id() != Some(chat_id) {
            self.emit_state();
            return;
        }
        let decision = self.viewport.on_mutation(chat_id, inserted);
        self.refresh_current_chat();
        self.emit_state();
        if decision == Some(FollowDecision::SnapToNewest) {
            self.emit_scroll_to_newest(chat_id);
        }
    }

    /// Drop everything tied to the current user.
    fn teardown_session(&mut self) {
        self.session = self.session.wrapping_add(1);
        self.poller.deactivate();
        self.viewport.clear();
        self.store.clear();
        self.pending_uploads.clear();
        self.conversations.clear();
        self.state.conversations.clear();
        self.state.current_chat = None;
        self.state.busy = BusyState::idle();
    }

    /// Returns false once the actor should stop.
    pub fn handle_message(&mut self, msg: CoreMsg) -> bool {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action`: it carries message content.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Shutdown => {
                tracing::info!("core: shutdown");
                self.poller.deactivate();
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::ConversationsFetched { user_id, result } => {
                self.handle_conversations_fetched(user_id, result)
            }
            InternalEvent::PollTick {
                chat_id,
                generation,
            } => self.handle_poll_tick(chat_id, generation),
            InternalEvent::MessagesFetched {
                chat_id,
                origin,
                result,
            } => self.handle_messages_fetched(chat_id, origin, result),
            InternalEvent::MessageSendResult {
                session,
                chat_id,
                local_id,
                result,
            } => self.handle_send_result(session, chat_id, local_id, result),
            InternalEvent::AttachmentUploaded {
                chat_id,
                local_id,
                index,
                result,
            } => self.handle_attachment_uploaded(chat_id, local_id, index, result),
            InternalEvent::ToastAutoDismiss { token } => {
                if token == self.toast_dismiss_token && self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Session
            AppAction::SetUser { user_id } => {
                let user_id = user_id.trim().to_string();
                if user_id.is_empty() {
                    self.toast("Enter a user id");
                    return;
                }
                if self.user_id.as_deref() != Some(user_id.as_str()) {
                    self.teardown_session();
                    tracing::info!(%user_id, "session: user set");
                    self.user_id = Some(user_id.clone());
                    self.state.user_id = Some(user_id);
                }
                self.set_busy(|b| b.loading_conversations = true);
                self.emit_state();
                self.refresh_conversations();
            }
            AppAction::ClearUser => {
                self.teardown_session();
                self.user_id = None;
                self.state.user_id = None;
                self.emit_state();
            }

            // Conversations
            AppAction::RefreshConversations => self.refresh_conversations(),
            AppAction::OpenConversation { chat_id } => self.open_conversation(chat_id),
            AppAction::CloseConversation => self.close_conversation(),
            AppAction::RefreshMessages => self.refresh_messages(),

            // Sending
            AppAction::SendMessage { chat_id, content } => self.send_text(chat_id, content),
            AppAction::SendAttachments {
                chat_id,
                caption,
                files,
            } => self.send_attachments(chat_id, caption, files),
            AppAction::RetryMessage {
                chat_id,
                message_id,
            } => self.retry_message(chat_id, message_id),
            AppAction::DiscardMessage {
                chat_id,
                message_id,
            } => self.discard_message(chat_id, message_id),

            // Viewport
            AppAction::ViewportScrolled {
                chat_id,
                scroll_top,
                scroll_height,
                viewport_height,
            } => {
                if self
                    .viewport
                    .on_scroll(&chat_id, scroll_top, scroll_height, viewport_height)
                {
                    self.refresh_current_chat();
                    self.emit_state();
                }
            }
            AppAction::JumpToNewest { chat_id } => {
                if self.viewport.jump_to_newest(&chat_id) {
                    self.refresh_current_chat();
                    self.emit_state();
                    self.emit_scroll_to_newest(&chat_id);
                }
            }

            // UI
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }

            // Lifecycle
            AppAction::Foregrounded => {
                self.refresh_conversations();
                self.refresh_messages();
            }
        }
    }
}
