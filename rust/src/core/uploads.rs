// Attachment staging and upload fan-out.
//
// Files are staged as ephemeral attachments on the provisional message, then uploaded
// concurrently (bounded by a shared semaphore). Each finished upload posts an
// `AttachmentUploaded` event back to the core, which records it in the `UploadBatch`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::actions::FileHandle;
use crate::backend::{with_deadline, BackendError, ChatBackend};
use crate::model::{Attachment, AttachmentUpload, Locator};
use crate::updates::{CoreMsg, InternalEvent};
use crate::wire::{UploadFile, UploadedResource};

pub(crate) const DEFAULT_MIME: &str = "application/octet-stream";

const MIME_BY_EXTENSION: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("heic", "image/heic"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("json", "application/json"),
    ("zip", "application/zip"),
];

pub(crate) fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    MIME_BY_EXTENSION
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| (*mime).to_string())
        .unwrap_or_else(|| DEFAULT_MIME.to_string())
}

/// `file://` URL for a local path, usable by the UI before the upload lands.
pub(crate) fn ephemeral_locator(path: &Path) -> Locator {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let url = url::Url::from_file_path(&absolute)
        .map(String::from)
        .unwrap_or_else(|_| format!("file://{}", absolute.display()));
    Locator::Ephemeral(url)
}

/// A picked file, kept for the lifetime of the batch so failed slots can be re-uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadSource {
    pub path: PathBuf,
    pub name: String,
    pub mime_type: String,
}

impl UploadSource {
    pub(crate) fn from_handle(handle: &FileHandle) -> Self {
        let name = handle
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                handle
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = handle
            .mime_type
            .clone()
            .filter(|m| m.contains('/'))
            .unwrap_or_else(|| guess_mime(&handle.path));
        Self {
            path: handle.path.clone(),
            name,
            mime_type,
        }
    }

    pub(crate) fn staged_attachment(&self) -> Attachment {
        Attachment {
            locator: ephemeral_locator(&self.path),
            mime_type: self.mime_type.clone(),
            name: self.name.clone(),
            size: std::fs::metadata(&self.path).ok().map(|m| m.len()),
            upload: AttachmentUpload::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Uploading,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    Complete,
    Failed { failed: usize, total: usize },
}

impl BatchOutcome {
    pub(crate) fn failure_reason(&self) -> Option<String> {
        match self {
            BatchOutcome::Complete => None,
            BatchOutcome::Failed { failed, total } => Some(format!(
                "{failed} of {total} attachments failed to upload"
            )),
        }
    }
}

/// Per-slot outcome tracker for one provisional message's attachments.
#[derive(Debug)]
pub(crate) struct UploadBatch {
    chat_id: String,
    sources: Vec<UploadSource>,
    slots: Vec<Slot>,
}

impl UploadBatch {
    pub(crate) fn new(chat_id: &str, sources: Vec<UploadSource>) -> Self {
        let slots = vec![Slot::Uploading; sources.len()];
        Self {
            chat_id: chat_id.to_string(),
            sources,
            slots,
        }
    }

    pub(crate) fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub(crate) fn source(&self, index: usize) -> Option<&UploadSource> {
        self.sources.get(index)
    }

    /// Put `indices` back in flight. Completed slots are left alone.
    pub(crate) fn restart(&mut self, indices: &[usize]) {
        for &index in indices {
            if let Some(slot) = self.slots.get_mut(index) {
                if matches!(slot, Slot::Failed(_)) {
                    *slot = Slot::Uploading;
                }
            }
        }
    }

    /// Record one slot's result. False for unknown or already-settled slots.
    pub(crate) fn record(&mut self, index: usize, result: Result<(), String>) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if *slot != Slot::Uploading {
            return false;
        }
        *slot = match result {
            Ok(()) => Slot::Done,
            Err(reason) => Slot::Failed(reason),
        };
        true
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slots.iter().all(|s| *s != Slot::Uploading)
    }

    pub(crate) fn outcome(&self) -> Option<BatchOutcome> {
        if !self.is_settled() {
            return None;
        }
        let failed = self
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Failed(_)))
            .count();
        if failed == 0 {
            Some(BatchOutcome::Complete)
        } else {
            Some(BatchOutcome::Failed {
                failed,
                total: self.slots.len(),
            })
        }
    }
}

pub(crate) struct UploadJob {
    pub chat_id: String,
    pub local_id: String,
    pub index: usize,
    pub source: UploadSource,
}

pub(crate) fn spawn_upload(
    runtime: &Handle,
    backend: Arc<dyn ChatBackend>,
    permits: Arc<Semaphore>,
    deadline: Duration,
    tx: Sender<CoreMsg>,
    job: UploadJob,
) {
    runtime.spawn(async move {
        let result = match permits.acquire_owned().await {
            Ok(_permit) => with_deadline(deadline, upload_one(backend.as_ref(), &job.source)).await,
            Err(_) => Err(BackendError::Io(std::io::Error::other("upload queue closed"))),
        };
        if let Err(e) = &result {
            tracing::warn!(
                chat_id = %job.chat_id,
                local_id = %job.local_id,
                index = job.index,
                error = %e,
                "upload: failed"
            );
        }
        let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::AttachmentUploaded {
            chat_id: job.chat_id,
            local_id: job.local_id,
            index: job.index,
            result,
        })));
    });
}

async fn upload_one(
    backend: &dyn ChatBackend,
    source: &UploadSource,
) -> Result<UploadedResource, BackendError> {
    let bytes = tokio::fs::read(&source.path).await?;
    tracing::debug!(name = %source.name, bytes = bytes.len(), "upload: start");
    backend
        .upload(UploadFile {
            name: source.name.clone(),
            mime_type: source.mime_type.clone(),
            bytes,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SendMessageRequest, WireConversation, WireMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source(path: &Path) -> UploadSource {
        UploadSource::from_handle(&FileHandle::new(path))
    }

    #[test]
    fn second_of_three_fails_the_batch_but_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let sources = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|n| source(&dir.path().join(n)))
            .collect();
        let mut batch = UploadBatch::new("C1", sources);

        assert!(batch.record(0, Ok(())));
        assert_eq!(batch.outcome(), None);
        assert!(batch.record(1, Err("boom".into())));
        assert!(!batch.is_settled());
        assert!(batch.record(2, Ok(())));

        let outcome = batch.outcome().unwrap();
        assert_eq!(outcome, BatchOutcome::Failed { failed: 1, total: 3 });
        assert_eq!(
            outcome.failure_reason().as_deref(),
            Some("1 of 3 attachments failed to upload")
        );

        // Retry only reopens the failed slot.
        batch.restart(&[0, 1, 2]);
        assert!(!batch.record(0, Ok(())));
        assert!(batch.record(1, Ok(())));
        assert_eq!(batch.outcome(), Some(BatchOutcome::Complete));
    }

    #[test]
    fn record_rejects_unknown_slots() {
        let mut batch = UploadBatch::new("C1", vec![]);
        assert!(batch.is_settled());
        assert_eq!(batch.outcome(), Some(BatchOutcome::Complete));
        assert!(!batch.record(3, Ok(())));
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime(Path::new("/x/photo.JPG")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("clip.mov")), "video/quicktime");
        assert_eq!(guess_mime(Path::new("notes")), DEFAULT_MIME);
        assert_eq!(guess_mime(Path::new("weird.xyz")), DEFAULT_MIME);
    }

    #[test]
    fn staged_attachment_points_at_the_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello world.txt");
        std::fs::write(&path, b"hello").unwrap();

        let staged = source(&path).staged_attachment();
        assert!(!staged.locator.is_durable());
        assert!(staged.locator.url().starts_with("file://"));
        assert!(staged.locator.url().ends_with("hello%20world.txt"));
        assert_eq!(staged.size, Some(5));
        assert_eq!(staged.mime_type, "text/plain");
        assert_eq!(staged.name, "hello world.txt");
        assert_eq!(staged.upload, AttachmentUpload::Pending);
    }

    #[test]
    fn explicit_name_and_mime_win() {
        let handle = FileHandle {
            path: PathBuf::from("/tmp/IMG_0001"),
            name: Some("beach.heic".into()),
            mime_type: Some("image/heic".into()),
        };
        let s = UploadSource::from_handle(&handle);
        assert_eq!(s.name, "beach.heic");
        assert_eq!(s.mime_type, "image/heic");
    }

    struct SlowUploads {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for SlowUploads {
        async fn list_conversations(&self, _: &str) -> Result<Vec<WireConversation>, BackendError> {
            Ok(vec![])
        }

        async fn list_messages(&self, _: &str) -> Result<Vec<WireMessage>, BackendError> {
            Ok(vec![])
        }

        async fn send_message(&self, _: SendMessageRequest) -> Result<WireMessage, BackendError> {
            Err(BackendError::Offline)
        }

        async fn upload(&self, file: UploadFile) -> Result<UploadedResource, BackendError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if file.name.starts_with("bad") {
                return Err(BackendError::Status {
                    status: 500,
                    body: "nope".into(),
                });
            }
            Ok(UploadedResource {
                url: format!("https://cdn.example.com/{}", file.name),
                mime_type: Some(file.mime_type),
                size: Some(file.bytes.len() as u64),
            })
        }
    }

    #[tokio::test]
    async fn uploads_are_bounded_and_report_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["a.png", "bad.png", "c.png", "d.png", "e.png"];
        for name in names {
            std::fs::write(dir.path().join(name), b"xx").unwrap();
        }
        let backend = Arc::new(SlowUploads {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let permits = Arc::new(Semaphore::new(2));
        let (tx, rx) = flume::unbounded();

        for (index, name) in names.iter().enumerate() {
            spawn_upload(
                &Handle::current(),
                backend.clone(),
                permits.clone(),
                Duration::from_secs(5),
                tx.clone(),
                UploadJob {
                    chat_id: "C1".into(),
                    local_id: "local-1".into(),
                    index,
                    source: source(&dir.path().join(name)),
                },
            );
        }

        let mut results = vec![None; names.len()];
        for _ in 0..names.len() {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
                .await
                .expect("upload event")
                .unwrap();
            let CoreMsg::Internal(ev) = msg else {
                panic!("unexpected message");
            };
            let InternalEvent::AttachmentUploaded { index, result, .. } = *ev else {
                panic!("unexpected event");
            };
            results[index] = Some(result.map(|r| r.url).map_err(|e| e.to_string()));
        }

        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            results[0].clone().unwrap().unwrap(),
            "https://cdn.example.com/a.png"
        );
        assert!(results[1].clone().unwrap().is_err());
        assert!(results[2..].iter().all(|r| matches!(r, Some(Ok(_)))));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SlowUploads {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (tx, rx) = flume::unbounded();
        spawn_upload(
            &Handle::current(),
            backend.clone(),
            Arc::new(Semaphore::new(1)),
            Duration::from_secs(5),
            tx,
            UploadJob {
                chat_id: "C1".into(),
                local_id: "local-1".into(),
                index: 0,
                source: source(&dir.path().join("gone.png")),
            },
        );
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("upload event")
            .unwrap();
        let CoreMsg::Internal(ev) = msg else {
            panic!("unexpected message");
        };
        assert!(matches!(
            *ev,
            InternalEvent::AttachmentUploaded {
                result: Err(BackendError::Io(_)),
                ..
            }
        ));
        assert_eq!(backend.peak.load(Ordering::SeqCst), 0);
    }
}
