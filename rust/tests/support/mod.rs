#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatsync_core::wire::{
    SendMessageRequest, UploadFile, UploadedResource, WireConversation, WireMessage,
    WireParticipant,
};
use chatsync_core::{BackendError, ChatBackend};
use chrono::Utc;
use tokio::sync::watch;

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

#[derive(Default)]
struct ServerState {
    conversations: Vec<WireConversation>,
    messages: HashMap<String, Vec<WireMessage>>,
    next_id: u64,
    fail_sends: bool,
    fail_directory: bool,
    failing_uploads: HashSet<String>,
    echo_client_ref: bool,
    list_calls: HashMap<String, usize>,
    upload_log: Vec<String>,
}

/// In-memory chat server.
///
/// Sends wait while the server is "offline" and resolve once it comes back, which is how
/// a request stuck on a dead network looks to the engine.
pub struct MockBackend {
    state: Mutex<ServerState>,
    online: watch::Sender<bool>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let (online, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(ServerState {
                next_id: 1,
                ..Default::default()
            }),
            online,
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn set_next_id(&self, next: u64) {
        self.with(|s| s.next_id = next);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.with(|s| s.fail_sends = fail);
    }

    pub fn set_fail_directory(&self, fail: bool) {
        self.with(|s| s.fail_directory = fail);
    }

    pub fn set_echo_client_ref(&self, echo: bool) {
        self.with(|s| s.echo_client_ref = echo);
    }

    pub fn fail_uploads_named(&self, name: &str) {
        self.with(|s| {
            s.failing_uploads.insert(name.to_string());
        });
    }

    pub fn clear_upload_failures(&self) {
        self.with(|s| s.failing_uploads.clear());
    }

    pub fn add_conversation(&self, id: &str, participants: &[(&str, Option<&str>)]) {
        self.with(|s| {
            s.conversations.push(WireConversation {
                id: id.to_string(),
                participants: participants
                    .iter()
                    .map(|(pid, name)| WireParticipant {
                        id: pid.to_string(),
                        display_name: name.map(str::to_string),
                    })
                    .collect(),
                last_message: None,
                last_activity_at: None,
            });
            s.messages.entry(id.to_string()).or_default();
        });
    }

    /// A message written by someone else, visible on the next listing.
    pub fn push_incoming(&self, chat_id: &str, sender_id: &str, content: &str) -> String {
        self.with(|s| {
            let id = take_id(s);
            let message = WireMessage {
                id: id.clone(),
                conversation_id: chat_id.to_string(),
                sender_id: sender_id.to_string(),
                receiver_id: None,
                content: content.to_string(),
                attachments: vec![],
                kind: Default::default(),
                status: Default::default(),
                created_at: Utc::now(),
                updated_at: None,
                client_ref: None,
            };
            store_message(s, message);
            id
        })
    }

    pub fn stored(&self, chat_id: &str) -> Vec<WireMessage> {
        self.with(|s| s.messages.get(chat_id).cloned().unwrap_or_default())
    }

    pub fn list_calls(&self, chat_id: &str) -> usize {
        self.with(|s| s.list_calls.get(chat_id).copied().unwrap_or(0))
    }

    pub fn uploads_of(&self, name: &str) -> usize {
        self.with(|s| s.upload_log.iter().filter(|n| n.as_str() == name).count())
    }
}

fn take_id(s: &mut ServerState) -> String {
    let id = format!("M{}", s.next_id);
    s.next_id += 1;
    id
}

fn store_message(s: &mut ServerState, message: WireMessage) {
    if let Some(conv) = s
        .conversations
        .iter_mut()
        .find(|c| c.id == message.conversation_id)
    {
        conv.last_message = Some(message.content.clone());
        conv.last_activity_at = Some(message.created_at);
    }
    s.messages
        .entry(message.conversation_id.clone())
        .or_default()
        .push(message);
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn list_conversations(
        &self,
        _user_id: &str,
    ) -> Result<Vec<WireConversation>, BackendError> {
        self.with(|s| {
            if s.fail_directory {
                return Err(BackendError::Status {
                    status: 503,
                    body: "directory unavailable".into(),
                });
            }
            Ok(s.conversations.clone())
        })
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<WireMessage>, BackendError> {
        if !*self.online.borrow() {
            return Err(BackendError::Offline);
        }
        self.with(|s| {
            *s.list_calls.entry(conversation_id.to_string()).or_default() += 1;
            Ok(s.messages.get(conversation_id).cloned().unwrap_or_default())
        })
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<WireMessage, BackendError> {
        let mut online = self.online.subscribe();
        let _ = online.wait_for(|up| *up).await;
        self.with(|s| {
            if s.fail_sends {
                return Err(BackendError::Status {
                    status: 500,
                    body: "send rejected".into(),
                });
            }
            let message = WireMessage {
                id: take_id(s),
                conversation_id: request.conversation_id,
                sender_id: request.sender_id,
                receiver_id: request.receiver_id,
                content: request.content,
                attachments: request.attachments,
                kind: request.kind,
                status: Default::default(),
                created_at: Utc::now(),
                updated_at: None,
                client_ref: s.echo_client_ref.then_some(request.client_ref),
            };
            store_message(s, message.clone());
            Ok(message)
        })
    }

    async fn upload(&self, file: UploadFile) -> Result<UploadedResource, BackendError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.with(|s| {
            s.upload_log.push(file.name.clone());
            if s.failing_uploads.contains(&file.name) {
                return Err(BackendError::Status {
                    status: 500,
                    body: format!("upload of {} rejected", file.name),
                });
            }
            Ok(UploadedResource {
                url: format!("https://cdn.test/{}", file.name),
                mime_type: Some(file.mime_type),
                size: Some(file.bytes.len() as u64),
            })
        })
    }
}
