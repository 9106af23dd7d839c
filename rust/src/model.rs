// Engine-side domain types: conversations, messages, attachments.
//
// These are what the Message Store owns. The UI never sees them directly; it gets the
// flattened `state::ChatMessage` snapshot instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Video,
    Audio,
}

/// Delivery status as reported by the server (or derived for local entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let top = mime_type
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match top.as_str() {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::File,
        }
    }

    pub fn message_kind(self) -> MessageKind {
        match self {
            AttachmentKind::Image => MessageKind::Image,
            AttachmentKind::Video => MessageKind::Video,
            AttachmentKind::Audio => MessageKind::Audio,
            AttachmentKind::File => MessageKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Local resource, only meaningful on this device until the upload lands.
    Ephemeral(String),
    Durable(String),
}

impl Locator {
    pub fn url(&self) -> &str {
        match self {
            Locator::Ephemeral(url) | Locator::Durable(url) => url,
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Locator::Durable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentUpload {
    Pending,
    Complete,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub locator: Locator,
    pub mime_type: String,
    pub name: String,
    pub size: Option<u64>,
    pub upload: AttachmentUpload,
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_mime(&self.mime_type)
    }
}

/// Where a message is in its optimistic lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Provisional { local_id: String },
    Confirmed { id: String, status: DeliveryStatus },
    Failed { local_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub delivery: Delivery,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provisional id echoed back by the server, if it supports it.
    pub client_ref: Option<String>,
}

impl Message {
    /// Stable identifier for UI keys: the confirmed id, or the provisional one.
    pub fn id(&self) -> &str {
        match &self.delivery {
            Delivery::Confirmed { id, .. } => id,
            Delivery::Provisional { local_id } | Delivery::Failed { local_id, .. } => local_id,
        }
    }

    pub fn confirmed_id(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Confirmed { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Provisional { local_id } | Delivery::Failed { local_id, .. } => {
                Some(local_id)
            }
            Delivery::Confirmed { .. } => None,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        match &self.delivery {
            Delivery::Provisional { .. } => DeliveryStatus::Sent,
            Delivery::Confirmed { status, .. } => *status,
            Delivery::Failed { .. } => DeliveryStatus::Error,
        }
    }

    pub fn in_flight(&self) -> bool {
        matches!(self.delivery, Delivery::Provisional { .. })
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// What the user typed/picked, before it becomes a provisional message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl Draft {
    pub fn text(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: None,
            content: content.into(),
            attachments: vec![],
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.attachments
            .first()
            .map(|a| a.kind().message_kind())
            .unwrap_or(MessageKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<Participant>,
    pub last_message: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// The participant on the other side of `user_id`. Falls back to `user_id` itself
    /// for note-to-self conversations.
    pub fn peer_of(&self, user_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.id != user_id)
            .or_else(|| self.participants.first())
    }
}
