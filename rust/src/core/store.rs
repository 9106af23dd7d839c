// Per-conversation ordered message lists with optimistic reconciliation.
//
// Mutations never fail: unknown ids are no-ops reported through the return value.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{Attachment, AttachmentUpload, Delivery, Draft, Locator, Message};

const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Local entries retired because the server echoed their client ref.
    pub reconciled: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0 || self.reconciled > 0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    // First-seen order; ties on created_at sort by this.
    seq: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct ConversationLog {
    entries: Vec<Entry>,
}

impl ConversationLog {
    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
    }

    fn position_confirmed(&self, id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.confirmed_id() == Some(id))
    }

    fn position_local(&self, local_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.local_id() == Some(local_id))
    }

    fn local_mut(&mut self, local_id: &str) -> Option<&mut Message> {
        self.entries
            .iter_mut()
            .map(|e| &mut e.message)
            .find(|m| m.local_id() == Some(local_id))
    }

    /// Keep the first entry per confirmed id.
    fn dedupe_confirmed(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        self.entries.retain(|e| match e.message.confirmed_id() {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        });
    }

    /// Fold one server message into the log. Returns which kind of change happened.
    fn absorb(&mut self, incoming: Message, next_seq: &mut u64, outcome: &mut MergeOutcome) {
        let Some(id) = incoming.confirmed_id().map(str::to_string) else {
            tracing::warn!("store: ignoring unconfirmed message in server batch");
            return;
        };

        if let Some(pos) = self.position_confirmed(&id) {
            if apply_server_update(&mut self.entries[pos].message, incoming) {
                outcome.updated += 1;
            }
            return;
        }

        if let Some(pos) = incoming
            .client_ref
            .as_deref()
            .and_then(|r| self.position_local(r))
        {
            self.entries[pos].message = incoming;
            outcome.reconciled += 1;
            return;
        }

        self.entries.push(Entry {
            seq: take_seq(next_seq),
            message: incoming,
        });
        outcome.inserted += 1;
    }
}

fn take_seq(next_seq: &mut u64) -> u64 {
    let seq = *next_seq;
    *next_seq = next_seq.saturating_add(1);
    seq
}

/// Copy the mutable server-owned fields. Returns true when something changed.
fn apply_server_update(existing: &mut Message, incoming: Message) -> bool {
    if *existing == incoming {
        return false;
    }
    // Never go backwards on a stale snapshot.
    if incoming.updated_at < existing.updated_at {
        return false;
    }
    *existing = incoming;
    true
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<String, ConversationLog>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_local_id() -> String {
        format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())
    }

    #[cfg(test)]
    pub fn is_local_id(id: &str) -> bool {
        id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Replace the server-derived part of a conversation with `server`.
    ///
    /// Provisional and failed entries are kept; a failed send is only removed by
    /// `discard`, and an in-flight one by `confirm_send`.
    pub fn load(&mut self, conversation_id: &str, server: Vec<Message>) -> Vec<Message> {
        let log = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();

        let previous_seqs: HashMap<String, u64> = log
            .entries
            .iter()
            .filter_map(|e| e.message.confirmed_id().map(|id| (id.to_string(), e.seq)))
            .collect();
        log.entries.retain(|e| e.message.local_id().is_some());

        let mut outcome = MergeOutcome::default();
        for message in server {
            let known_seq = message
                .confirmed_id()
                .and_then(|id| previous_seqs.get(id))
                .copied();
            let before = log.entries.len();
            log.absorb(message, &mut self.next_seq, &mut outcome);
            // Keep the old position for ids we already had.
            if let (Some(seq), true) = (known_seq, log.entries.len() > before) {
                if let Some(last) = log.entries.last_mut() {
                    last.seq = seq;
                }
            }
        }
        log.sort();
        tracing::debug!(
            conversation_id,
            count = log.entries.len(),
            reconciled = outcome.reconciled,
            "store: load"
        );
        log.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Idempotent union of `server` into the conversation.
    pub fn merge_incoming(&mut self, conversation_id: &str, server: Vec<Message>) -> MergeOutcome {
        let log = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        let mut outcome = MergeOutcome::default();
        for message in server {
            log.absorb(message, &mut self.next_seq, &mut outcome);
        }
        if outcome.changed() {
            log.dedupe_confirmed();
            log.sort();
        }
        outcome
    }

    /// Append a provisional message for `draft` and return its provisional id.
    pub fn send_optimistic(&mut self, conversation_id: &str, draft: Draft) -> String {
        self.send_optimistic_at(conversation_id, draft, Utc::now())
    }

    pub fn send_optimistic_at(
        &mut self,
        conversation_id: &str,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> String {
        let local_id = Self::new_local_id();
        let kind = draft.kind();
        let message = Message {
            delivery: Delivery::Provisional {
                local_id: local_id.clone(),
            },
            conversation_id: conversation_id.to_string(),
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            content: draft.content,
            attachments: draft.attachments,
            kind,
            created_at: now,
            updated_at: now,
            client_ref: None,
        };
        let seq = take_seq(&mut self.next_seq);
        let log = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        log.entries.push(Entry { seq, message });
        log.sort();
        local_id
    }

    /// Replace the provisional entry with the server's copy. Safe when a poll already
    /// delivered `confirmed`, and when the provisional entry is already gone.
    pub fn confirm_send(&mut self, conversation_id: &str, local_id: &str, confirmed: Message) {
        let Some(confirmed_id) = confirmed.confirmed_id().map(str::to_string) else {
            tracing::warn!(conversation_id, local_id, "store: confirm_send without server id");
            return;
        };
        let Some(log) = self.conversations.get_mut(conversation_id) else {
            tracing::debug!(conversation_id, local_id, "store: confirm for unknown conversation");
            return;
        };

        let provisional_seq = log.position_local(local_id).map(|pos| log.entries.remove(pos).seq);

        match log.position_confirmed(&confirmed_id) {
            Some(pos) => {
                apply_server_update(&mut log.entries[pos].message, confirmed);
            }
            None => {
                let seq = provisional_seq.unwrap_or_else(|| take_seq(&mut self.next_seq));
                log.entries.push(Entry {
                    seq,
                    message: confirmed,
                });
            }
        }
        log.dedupe_confirmed();
        log.sort();
        tracing::debug!(conversation_id, local_id, %confirmed_id, "store: confirmed");
    }

    /// Mark a provisional send as failed. Returns false if there was nothing in flight; an
    /// already failed entry only has its reason replaced.
    pub fn fail_send(&mut self, conversation_id: &str, local_id: &str, reason: &str) -> bool {
        let Some(message) = self
            .conversations
            .get_mut(conversation_id)
            .and_then(|log| log.local_mut(local_id))
        else {
            return false;
        };
        if let Delivery::Failed { reason: current, .. } = &mut message.delivery {
            *current = reason.to_string();
            return false;
        }
        if !matches!(message.delivery, Delivery::Provisional { .. }) {
            return false;
        }
        message.delivery = Delivery::Failed {
            local_id: local_id.to_string(),
            reason: reason.to_string(),
        };
        message.updated_at = Utc::now();
        true
    }

    /// Flip a failed send back to provisional and return a copy to re-send.
    pub fn retry(&mut self, conversation_id: &str, local_id: &str) -> Option<Message> {
        let message = self
            .conversations
            .get_mut(conversation_id)?
            .local_mut(local_id)?;
        if !matches!(message.delivery, Delivery::Failed { .. }) {
            return None;
        }
        message.delivery = Delivery::Provisional {
            local_id: local_id.to_string(),
        };
        message.updated_at = Utc::now();
        Some(message.clone())
    }

    /// Drop a failed send the user has acknowledged.
    pub fn discard(&mut self, conversation_id: &str, local_id: &str) -> bool {
        let Some(log) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(pos) = log.position_local(local_id) else {
            return false;
        };
        if !matches!(log.entries[pos].message.delivery, Delivery::Failed { .. }) {
            return false;
        }
        log.entries.remove(pos);
        true
    }

    pub fn attachment_uploaded(
        &mut self,
        conversation_id: &str,
        local_id: &str,
        index: usize,
        durable_url: String,
        size: Option<u64>,
    ) -> bool {
        let Some(attachment) = self.attachment_mut(conversation_id, local_id, index) else {
            return false;
        };
        attachment.locator = Locator::Durable(durable_url);
        if size.is_some() {
            attachment.size = size;
        }
        attachment.upload = AttachmentUpload::Complete;
        true
    }

    pub fn attachment_failed(
        &mut self,
        conversation_id: &str,
        local_id: &str,
        index: usize,
        reason: &str,
    ) -> bool {
        let Some(attachment) = self.attachment_mut(conversation_id, local_id, index) else {
            return false;
        };
        attachment.upload = AttachmentUpload::Failed {
            reason: reason.to_string(),
        };
        true
    }

    /// Put failed attachments back to pending before a retry; returns their indices.
    pub fn reset_failed_attachments(&mut self, conversation_id: &str, local_id: &str) -> Vec<usize> {
        let Some(message) = self
            .conversations
            .get_mut(conversation_id)
            .and_then(|log| log.local_mut(local_id))
        else {
            return vec![];
        };
        let mut reset = Vec::new();
        for (index, attachment) in message.attachments.iter_mut().enumerate() {
            if matches!(attachment.upload, AttachmentUpload::Failed { .. }) {
                attachment.upload = AttachmentUpload::Pending;
                reset.push(index);
            }
        }
        reset
    }

    fn attachment_mut(
        &mut self,
        conversation_id: &str,
        local_id: &str,
        index: usize,
    ) -> Option<&mut Attachment> {
        self.conversations
            .get_mut(conversation_id)?
            .local_mut(local_id)?
            .attachments
            .get_mut(index)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .get(conversation_id)
            .map(|log| log.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, id: &str) -> Option<&Message> {
        self.conversations
            .get(conversation_id)?
            .entries
            .iter()
            .map(|e| &e.message)
            .find(|m| m.id() == id)
    }

    pub fn newest(&self, conversation_id: &str) -> Option<&Message> {
        self.conversations
            .get(conversation_id)?
            .entries
            .last()
            .map(|e| &e.message)
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryStatus, MessageKind};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn server(id: &str, secs: i64, content: &str) -> Message {
        Message {
            delivery: Delivery::Confirmed {
                id: id.into(),
                status: DeliveryStatus::Sent,
            },
            conversation_id: "C1".into(),
            sender_id: "bob".into(),
            receiver_id: Some("alice".into()),
            content: content.into(),
            attachments: vec![],
            kind: MessageKind::Text,
            created_at: at(secs),
            updated_at: at(secs),
            client_ref: None,
        }
    }

    fn ids(store: &MessageStore) -> Vec<String> {
        store
            .messages("C1")
            .iter()
            .map(|m| m.id().to_string())
            .collect()
    }

    #[test]
    fn load_sorts_by_creation_time() {
        let mut store = MessageStore::new();
        let loaded = store.load(
            "C1",
            vec![server("M3", 30, "c"), server("M1", 10, "a"), server("M2", 20, "b")],
        );
        let loaded_ids: Vec<&str> = loaded.iter().map(|m| m.id()).collect();
        assert_eq!(loaded_ids, vec!["M1", "M2", "M3"]);
    }

    #[test]
    fn timestamp_ties_keep_first_seen_order() {
        let mut store = MessageStore::new();
        store.merge_incoming("C1", vec![server("Mb", 10, "b"), server("Ma", 10, "a")]);
        store.merge_incoming("C1", vec![server("Mc", 10, "c"), server("Ma", 10, "a")]);
        assert_eq!(ids(&store), vec!["Mb", "Ma", "Mc"]);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut store = MessageStore::new();
        let batch = vec![server("M2", 20, "b"), server("M1", 10, "a"), server("M1", 10, "a")];
        let first = store.merge_incoming("C1", batch.clone());
        assert_eq!(first.inserted, 2);
        let once = store.messages("C1");

        let second = store.merge_incoming("C1", batch);
        assert!(!second.changed());
        assert_eq!(store.messages("C1"), once);
    }

    #[test]
    fn overlapping_batches_union_by_id() {
        let mut store = MessageStore::new();
        store.merge_incoming("C1", vec![server("M1", 10, "a"), server("M2", 20, "b")]);
        let outcome =
            store.merge_incoming("C1", vec![server("M2", 20, "b"), server("M3", 30, "c")]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(ids(&store), vec!["M1", "M2", "M3"]);
    }

    #[test]
    fn later_poll_updates_status_in_place() {
        let mut store = MessageStore::new();
        store.merge_incoming("C1", vec![server("M1", 10, "a"), server("M2", 20, "b")]);
        let mut read = server("M1", 10, "a");
        read.delivery = Delivery::Confirmed {
            id: "M1".into(),
            status: DeliveryStatus::Read,
        };
        read.updated_at = at(40);
        let outcome = store.merge_incoming("C1", vec![read]);
        assert_eq!(outcome.updated, 1);
        assert_eq!(ids(&store), vec!["M1", "M2"]);
        assert_eq!(
            store.message("C1", "M1").map(|m| m.status()),
            Some(DeliveryStatus::Read)
        );
    }

    #[test]
    fn stale_snapshot_does_not_roll_back_status() {
        let mut store = MessageStore::new();
        let mut read = server("M1", 10, "a");
        read.delivery = Delivery::Confirmed {
            id: "M1".into(),
            status: DeliveryStatus::Read,
        };
        read.updated_at = at(40);
        store.merge_incoming("C1", vec![read]);
        let outcome = store.merge_incoming("C1", vec![server("M1", 10, "a")]);
        assert!(!outcome.changed());
        assert_eq!(
            store.message("C1", "M1").map(|m| m.status()),
            Some(DeliveryStatus::Read)
        );
    }

    #[test]
    fn optimistic_send_is_visible_and_in_flight() {
        let mut store = MessageStore::new();
        store.load("C1", vec![server("M1", 10, "a")]);
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
        assert!(MessageStore::is_local_id(&local_id));

        let msgs = store.messages("C1");
        assert_eq!(msgs.len(), 2);
        let last = &msgs[1];
        assert_eq!(last.local_id(), Some(local_id.as_str()));
        assert!(last.in_flight());
        assert_eq!(last.status(), DeliveryStatus::Sent);
        assert_eq!(last.content, "hi");
    }

    #[test]
    fn confirm_replaces_provisional_exactly_once() {
        let mut store = MessageStore::new();
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
        store.confirm_send("C1", &local_id, server("M42", 21, "hi"));

        let msgs = store.messages("C1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].confirmed_id(), Some("M42"));
        assert_eq!(msgs[0].content, "hi");
        assert!(msgs.iter().all(|m| m.local_id() != Some(local_id.as_str())));
    }

    #[test]
    fn poll_before_confirm_still_leaves_one_copy() {
        let mut store = MessageStore::new();
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));

        // The poll already knows M42 but the server does not echo client refs.
        store.merge_incoming("C1", vec![server("M42", 21, "hi")]);
        store.confirm_send("C1", &local_id, server("M42", 21, "hi"));
        store.merge_incoming("C1", vec![server("M42", 21, "hi")]);

        assert_eq!(ids(&store), vec!["M42"]);
    }

    #[test]
    fn echoed_client_ref_retires_provisional_during_merge() {
        let mut store = MessageStore::new();
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
        let mut echoed = server("M42", 21, "hi");
        echoed.client_ref = Some(local_id.clone());

        let outcome = store.merge_incoming("C1", vec![echoed.clone()]);
        assert_eq!(outcome.reconciled, 1);
        assert_eq!(ids(&store), vec!["M42"]);

        // Confirmation arriving afterwards finds nothing left to replace.
        store.confirm_send("C1", &local_id, echoed);
        assert_eq!(ids(&store), vec!["M42"]);
    }

    #[test]
    fn confirmed_message_inherits_provisional_position() {
        let mut store = MessageStore::new();
        let first = store.send_optimistic_at("C1", Draft::text("alice", "one"), at(20));
        let _second = store.send_optimistic_at("C1", Draft::text("alice", "two"), at(20));
        store.confirm_send("C1", &first, server("M1", 20, "one"));

        let msgs = store.messages("C1");
        assert_eq!(msgs[0].confirmed_id(), Some("M1"));
        assert_eq!(msgs[1].content, "two");
    }

    #[test]
    fn failed_send_stays_visible_with_error_status() {
        let mut store = MessageStore::new();
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
        assert!(store.fail_send("C1", &local_id, "offline"));
        assert!(!store.fail_send("C1", &local_id, "again"));

        let msgs = store.messages("C1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status(), DeliveryStatus::Error);
        assert!(!msgs[0].in_flight());
        // A second failure only refreshes the reason.
        assert_eq!(msgs[0].failure_reason(), Some("again"));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let mut store = MessageStore::new();
        assert!(!store.fail_send("C1", "local-missing", "x"));
        assert!(store.retry("C1", "local-missing").is_none());
        assert!(!store.discard("C1", "local-missing"));
        assert!(!store.attachment_failed("C1", "local-missing", 0, "x"));
        store.confirm_send("C1", "local-missing", server("M9", 10, "late"));
        assert!(store.messages("C1").is_empty());
        assert_eq!(store.len("C1"), 0);
    }

    #[test]
    fn load_keeps_local_entries_and_replaces_server_ones() {
        let mut store = MessageStore::new();
        store.merge_incoming("C1", vec![server("M1", 10, "a"), server("Mgone", 15, "x")]);
        let pending = store.send_optimistic_at("C1", Draft::text("alice", "p"), at(30));
        let failed = store.send_optimistic_at("C1", Draft::text("alice", "f"), at(31));
        store.fail_send("C1", &failed, "offline");

        store.load("C1", vec![server("M1", 10, "a"), server("M2", 20, "b")]);
        assert_eq!(
            ids(&store),
            vec!["M1".to_string(), "M2".to_string(), pending, failed]
        );
    }

    #[test]
    fn retry_and_discard_only_touch_failed_sends() {
        let mut store = MessageStore::new();
        let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
        assert!(store.retry("C1", &local_id).is_none());
        assert!(!store.discard("C1", &local_id));

        store.fail_send("C1", &local_id, "offline");
        let again = store.retry("C1", &local_id).expect("retry");
        assert!(again.in_flight());

        store.fail_send("C1", &local_id, "offline");
        assert!(store.discard("C1", &local_id));
        assert!(store.messages("C1").is_empty());
    }

    #[test]
    fn interleavings_converge() {
        // optimistic -> poll -> confirm vs optimistic -> confirm -> poll
        let run = |poll_first: bool| {
            let mut store = MessageStore::new();
            store.load("C1", vec![server("M1", 10, "a")]);
            let local_id = store.send_optimistic_at("C1", Draft::text("alice", "hi"), at(20));
            let batch = vec![server("M1", 10, "a"), server("M42", 21, "hi")];
            if poll_first {
                store.merge_incoming("C1", batch);
                store.confirm_send("C1", &local_id, server("M42", 21, "hi"));
            } else {
                store.confirm_send("C1", &local_id, server("M42", 21, "hi"));
                store.merge_incoming("C1", batch);
            }
            store.messages("C1")
        };
        assert_eq!(run(true), run(false));
    }
}
