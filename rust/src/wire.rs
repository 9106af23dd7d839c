// JSON shapes exchanged with the backend, and their conversion into engine types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Attachment, AttachmentUpload, Conversation, Delivery, DeliveryStatus, Locator, Message,
    MessageKind, Participant,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireParticipant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConversation {
    pub id: String,
    pub participants: Vec<WireParticipant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttachment {
    pub url: String,
    pub mime_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<WireAttachment>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Body of the message-send endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<WireAttachment>,
    /// Provisional id; servers may echo it on the stored message.
    pub client_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedResource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<WireConversation> for Conversation {
    fn from(w: WireConversation) -> Self {
        Conversation {
            id: w.id,
            participants: w
                .participants
                .into_iter()
                .map(|p| Participant {
                    id: p.id,
                    display_name: p.display_name.filter(|n| !n.trim().is_empty()),
                })
                .collect(),
            last_message: w.last_message,
            last_activity_at: w.last_activity_at,
        }
    }
}

impl From<WireAttachment> for Attachment {
    fn from(w: WireAttachment) -> Self {
        Attachment {
            locator: Locator::Durable(w.url),
            mime_type: w.mime_type,
            name: w.name,
            size: w.size,
            upload: AttachmentUpload::Complete,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(w: WireMessage) -> Self {
        let updated_at = w.updated_at.unwrap_or(w.created_at);
        Message {
            delivery: Delivery::Confirmed {
                id: w.id,
                status: w.status,
            },
            conversation_id: w.conversation_id,
            sender_id: w.sender_id,
            receiver_id: w.receiver_id,
            content: w.content,
            attachments: w.attachments.into_iter().map(Attachment::from).collect(),
            kind: w.kind,
            created_at: w.created_at,
            updated_at,
            client_ref: w.client_ref.filter(|r| !r.is_empty()),
        }
    }
}

/// Attachment descriptor for the send endpoint. Only durable locators are sendable.
pub(crate) fn wire_attachment(attachment: &Attachment) -> Option<WireAttachment> {
    match &attachment.locator {
        Locator::Durable(url) => Some(WireAttachment {
            url: url.clone(),
            mime_type: attachment.mime_type.clone(),
            name: attachment.name.clone(),
            size: attachment.size,
        }),
        Locator::Ephemeral(_) => None,
    }
}
