use super::*;

use crate::actions::FileHandle;
use crate::backend::{with_deadline, BackendError};
use crate::model::{Draft, Message};
use crate::wire::{wire_attachment, SendMessageRequest, UploadedResource};

use uploads::{spawn_upload, BatchOutcome, UploadJob, UploadSource};

impl AppCore {
    fn draft_for(&self, chat_id: &str, content: String) -> Option<Draft> {
        let Some(user_id) = self.user_id.as_deref() else {
            tracing::warn!(%chat_id, "send: no user set");
            return None;
        };
        let receiver_id = self
            .conversations
            .iter()
            .find(|c| c.id == chat_id)
            .and_then(|c| c.peer_of(user_id))
            .map(|p| p.id.clone());
        let mut draft = Draft::text(user_id, content);
        draft.receiver_id = receiver_id;
        Some(draft)
    }

    pub(super) fn send_text(&mut self, chat_id: String, content: String) {
        if content.trim().is_empty() {
            tracing::debug!(%chat_id, "send: empty text ignored");
            return;
        }
        let Some(draft) = self.draft_for(&chat_id, content) else {
            return;
        };
        // Visible before the network is touched.
        let local_id = self.store.send_optimistic(&chat_id, draft);
        tracing::info!(%chat_id, %local_id, "send: optimistic");
        self.after_chat_mutation(&chat_id, 1);
        self.spawn_send(&chat_id, &local_id);
    }

    pub(super) fn send_attachments(
        &mut self,
        chat_id: String,
        caption: String,
        files: Vec<FileHandle>,
    ) {
        if files.is_empty() {
            self.send_text(chat_id, caption);
            return;
        }
        let Some(mut draft) = self.draft_for(&chat_id, caption) else {
            return;
        };
        let sources: Vec<UploadSource> = files.iter().map(UploadSource::from_handle).collect();
        draft.attachments = sources.iter().map(UploadSource::staged_attachment).collect();

        let local_id = self.store.send_optimistic(&chat_id, draft);
        tracing::info!(%chat_id, %local_id, files = sources.len(), "send: optimistic with attachments");
        let indices: Vec<usize> = (0..sources.len()).collect();
        self.pending_uploads
            .insert(local_id.clone(), UploadBatch::new(&chat_id, sources));
        self.after_chat_mutation(&chat_id, 1);
        self.spawn_uploads(&local_id, &indices);
    }

    fn spawn_uploads(&self, local_id: &str, indices: &[usize]) {
        let Some(batch) = self.pending_uploads.get(local_id) else {
            return;
        };
        for &index in indices {
            let Some(source) = batch.source(index) else {
                continue;
            };
            spawn_upload(
                self.runtime.handle(),
                self.backend.clone(),
                self.upload_permits.clone(),
                self.config.upload_timeout(),
                self.core_sender.clone(),
                UploadJob {
                    chat_id: batch.chat_id().to_string(),
                    local_id: local_id.to_string(),
                    index,
                    source: source.clone(),
                },
            );
        }
    }

    pub(super) fn handle_attachment_uploaded(
        &mut self,
        chat_id: String,
        local_id: String,
        index: usize,
        result: Result<UploadedResource, BackendError>,
    ) {
        let Some(batch) = self.pending_uploads.get_mut(&local_id) else {
            tracing::debug!(%chat_id, %local_id, index, "upload: no batch (discarded?)");
            return;
        };
        let name = batch
            .source(index)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let (recorded, failed) = match result {
            Ok(resource) => {
                tracing::info!(%chat_id, %local_id, index, "upload: complete");
                self.store
                    .attachment_uploaded(&chat_id, &local_id, index, resource.url, resource.size);
                (batch.record(index, Ok(())), false)
            }
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .attachment_failed(&chat_id, &local_id, index, &reason);
                (batch.record(index, Err(reason)), true)
            }
        };
        if !recorded {
            return;
        }

        match batch.outcome() {
            None => {
                if failed {
                    // Siblings keep uploading; the message is an error from now on.
                    let reason = format!("{name} failed to upload");
                    if self.store.fail_send(&chat_id, &local_id, &reason) {
                        tracing::warn!(%chat_id, %local_id, index, "send: attachment failed");
                    }
                }
                self.after_chat_mutation(&chat_id, 0)
            }
            Some(BatchOutcome::Complete) => {
                self.pending_uploads.remove(&local_id);
                self.after_chat_mutation(&chat_id, 0);
                self.spawn_send(&chat_id, &local_id);
            }
            Some(outcome @ BatchOutcome::Failed { .. }) => {
                // Batch stays around so a retry can re-upload just the failed slots.
                let reason = outcome.failure_reason().unwrap_or_default();
                tracing::warn!(%chat_id, %local_id, %reason, "send: attachments failed");
                self.store.fail_send(&chat_id, &local_id, &reason);
                self.set_toast(reason);
                self.after_chat_mutation(&chat_id, 0);
            }
        }
    }

    fn spawn_send(&self, chat_id: &str, local_id: &str) {
        let Some(message) = self.store.message(chat_id, local_id) else {
            tracing::warn!(%chat_id, %local_id, "send: provisional message missing");
            return;
        };
        let request = send_request(message, local_id);
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        let deadline = self.config.send_timeout();
        let session = self.session;
        let chat_id = chat_id.to_string();
        let local_id = local_id.to_string();
        self.runtime.spawn(async move {
            let result = with_deadline(deadline, backend.send_message(request))
                .await
                .map(Message::from);
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::MessageSendResult {
                    session,
                    chat_id,
                    local_id,
                    result,
                },
            )));
        });
    }

    pub(super) fn handle_send_result(
        &mut self,
        session: u64,
        chat_id: String,
        local_id: String,
        result: Result<Message, BackendError>,
    ) {
        if session != self.session || self.user_id.is_none() {
            tracing::debug!(%chat_id, %local_id, "send: result from an earlier session dropped");
            return;
        }
        match result {
            Ok(confirmed) => {
                tracing::info!(%chat_id, %local_id, id = confirmed.id(), "send: confirmed");
                self.store.confirm_send(&chat_id, &local_id, confirmed);
                self.after_chat_mutation(&chat_id, 0);
            }
            Err(e) => {
                tracing::warn!(%chat_id, %local_id, error = %e, "send: failed");
                if self.store.fail_send(&chat_id, &local_id, &e.to_string()) {
                    self.set_toast("Message failed to send");
                    self.after_chat_mutation(&chat_id, 0);
                }
            }
        }
    }

    pub(super) fn retry_message(&mut self, chat_id: String, message_id: String) {
        if self.store.retry(&chat_id, &message_id).is_none() {
            tracing::warn!(%chat_id, %message_id, "retry: no failed message");
            return;
        }
        tracing::info!(%chat_id, local_id = %message_id, "retry");

        if self.pending_uploads.contains_key(&message_id) {
            let indices = self.store.reset_failed_attachments(&chat_id, &message_id);
            if let Some(batch) = self.pending_uploads.get_mut(&message_id) {
                batch.restart(&indices);
            }
            self.after_chat_mutation(&chat_id, 0);
            self.spawn_uploads(&message_id, &indices);
            return;
        }
        self.after_chat_mutation(&chat_id, 0);
        self.spawn_send(&chat_id, &message_id);
    }

    pub(super) fn discard_message(&mut self, chat_id: String, message_id: String) {
        if !self.store.discard(&chat_id, &message_id) {
            tracing::warn!(%chat_id, %message_id, "discard: no failed message");
            return;
        }
        self.pending_uploads.remove(&message_id);
        self.after_chat_mutation(&chat_id, 0);
    }
}

fn send_request(message: &Message, local_id: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: message.conversation_id.clone(),
        sender_id: message.sender_id.clone(),
        receiver_id: message.receiver_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
        attachments: message
            .attachments
            .iter()
            .filter_map(wire_attachment)
            .collect(),
        client_ref: local_id.to_string(),
    }
}
