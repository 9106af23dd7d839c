// Conversation list normalization: peer labels, previews, recency strings.

use chrono::{DateTime, Datelike, Duration, Local, Utc};

use crate::model::{Conversation, Message};
use crate::state::ConversationSummary;

const NO_MESSAGES_PREVIEW: &str = "No messages yet";
const ATTACHMENT_PREVIEW: &str = "Attachment";
const NOTE_TO_SELF_LABEL: &str = "Note to self";
const PREVIEW_MAX_CHARS: usize = 120;

/// Build UI rows for `conversations`, most recently active first.
///
/// `newest_local` is consulted per conversation so that a send that has not reached the
/// server's listing yet still shows up as the preview.
pub(super) fn summarize<'a>(
    conversations: &[Conversation],
    user_id: &str,
    now: DateTime<Utc>,
    newest_local: impl Fn(&str) -> Option<&'a Message>,
) -> Vec<ConversationSummary> {
    let mut rows: Vec<ConversationSummary> = conversations
        .iter()
        .map(|conv| {
            let stored_at = conv.last_activity_at;
            let local = newest_local(&conv.id);
            let (preview_source, last_activity_at) = match (stored_at, local) {
                (Some(a), Some(m)) if m.created_at > a => (Preview::Local(m), Some(m.created_at)),
                (None, Some(m)) => (Preview::Local(m), Some(m.created_at)),
                _ => (Preview::Stored(conv.last_message.as_deref()), stored_at),
            };
            let peer = conv.peer_of(user_id);
            ConversationSummary {
                chat_id: conv.id.clone(),
                peer_id: peer.map(|p| p.id.clone()).unwrap_or_default(),
                display_name: peer_label(conv, user_id),
                last_message_preview: preview_source.text(),
                last_activity_at: last_activity_at.map(|t| t.timestamp()),
                recency: last_activity_at
                    .map(|t| recency_label(t, now))
                    .unwrap_or_default(),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.chat_id.cmp(&b.chat_id))
    });
    rows
}

enum Preview<'a> {
    Stored(Option<&'a str>),
    Local(&'a Message),
}

impl Preview<'_> {
    fn text(&self) -> String {
        let raw = match self {
            Preview::Stored(None) => return NO_MESSAGES_PREVIEW.to_string(),
            Preview::Stored(Some(text)) => *text,
            Preview::Local(m) if m.content.trim().is_empty() && !m.attachments.is_empty() => {
                return ATTACHMENT_PREVIEW.to_string()
            }
            Preview::Local(m) => m.content.as_str(),
        };
        let line = raw.lines().next().unwrap_or_default().trim();
        if line.is_empty() {
            return NO_MESSAGES_PREVIEW.to_string();
        }
        truncate_chars(line, PREVIEW_MAX_CHARS)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub(super) fn peer_label(conv: &Conversation, user_id: &str) -> String {
    let Some(peer) = conv.peer_of(user_id) else {
        return "Conversation".to_string();
    };
    if peer.id == user_id {
        return NOTE_TO_SELF_LABEL.to_string();
    }
    peer.display_name
        .clone()
        .unwrap_or_else(|| truncated_id(&peer.id))
}

fn truncated_id(id: &str) -> String {
    if id.chars().count() <= 16 {
        return id.to_string();
    }
    let head: String = id.chars().take(8).collect();
    let tail: String = id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head}…{tail}")
}

/// Human recency relative to `now` ("now", "5m", "3h", "Yesterday", weekday, date).
pub(super) fn recency_label(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    if elapsed < Duration::minutes(1) {
        return "now".to_string();
    }
    if elapsed < Duration::hours(1) {
        return format!("{}m", elapsed.num_minutes());
    }

    let local_at = at.with_timezone(&Local);
    let local_now = now.with_timezone(&Local);
    let days = local_now
        .date_naive()
        .signed_duration_since(local_at.date_naive())
        .num_days();

    if days == 0 {
        return format!("{}h", elapsed.num_hours());
    }
    if days == 1 {
        return "Yesterday".to_string();
    }
    if days < 7 {
        return local_at.format("%A").to_string();
    }
    if local_at.year() == local_now.year() {
        return local_at.format("%b %-d").to_string();
    }
    local_at.format("%b %-d, %Y").to_string()
}
