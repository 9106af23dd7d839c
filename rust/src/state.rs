// UI-facing snapshot types. Everything here is plain data, cloned out of the core on
// every emit.

use crate::model::{AttachmentKind, AttachmentUpload, DeliveryStatus, Message, MessageKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub rev: u64,
    pub user_id: Option<String>,
    pub conversations: Vec<ConversationSummary>,
    pub current_chat: Option<ChatViewState>,
    pub busy: BusyState,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            user_id: None,
            conversations: vec![],
            current_chat: None,
            busy: BusyState::idle(),
            toast: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyState {
    pub loading_conversations: bool,
    pub loading_messages: bool,
}

impl BusyState {
    pub fn idle() -> Self {
        Self {
            loading_conversations: false,
            loading_messages: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub chat_id: String,
    pub peer_id: String,
    pub display_name: String,
    pub last_message_preview: String,
    /// Unix seconds.
    pub last_activity_at: Option<i64>,
    pub recency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatViewState {
    pub chat_id: String,
    pub peer_label: String,
    pub messages: Vec<ChatMessage>,
    pub auto_follow: bool,
    /// Messages that arrived while the user was scrolled away from the bottom.
    pub new_message_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Confirmed id, or the provisional id while unconfirmed.
    pub id: String,
    pub local_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub in_flight: bool,
    pub failure_reason: Option<String>,
    pub attachments: Vec<ChatAttachment>,
    /// Unix seconds.
    pub timestamp: i64,
    pub display_timestamp: String,
    pub is_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAttachment {
    pub url: String,
    pub is_local: bool,
    pub mime_type: String,
    pub name: String,
    pub size: Option<u64>,
    pub kind: AttachmentKind,
    pub upload: AttachmentUploadState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentUploadState {
    Uploading,
    Complete,
    Failed { reason: String },
}

impl ChatMessage {
    pub(crate) fn from_message(m: &Message, my_user_id: &str) -> Self {
        Self {
            id: m.id().to_string(),
            local_id: m.local_id().map(str::to_string),
            sender_id: m.sender_id.clone(),
            content: m.content.clone(),
            kind: m.kind,
            status: m.status(),
            in_flight: m.in_flight(),
            failure_reason: m.failure_reason().map(str::to_string),
            attachments: m
                .attachments
                .iter()
                .map(|a| ChatAttachment {
                    url: a.locator.url().to_string(),
                    is_local: !a.locator.is_durable(),
                    mime_type: a.mime_type.clone(),
                    name: a.name.clone(),
                    size: a.size,
                    kind: a.kind(),
                    upload: match &a.upload {
                        AttachmentUpload::Pending => AttachmentUploadState::Uploading,
                        AttachmentUpload::Complete => AttachmentUploadState::Complete,
                        AttachmentUpload::Failed { reason } => AttachmentUploadState::Failed {
                            reason: reason.clone(),
                        },
                    },
                })
                .collect(),
            timestamp: m.created_at.timestamp(),
            display_timestamp: format_display_timestamp(m.created_at),
            is_mine: m.sender_id == my_user_id,
        }
    }
}

fn format_display_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&chrono::Local)
        .format("%l:%M %p")
        .to_string()
        .trim()
        .to_string()
}
