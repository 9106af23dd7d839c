use crate::backend::BackendError;
use crate::model::{Conversation, Message};
use crate::state::AppState;
use crate::wire::UploadedResource;
use crate::AppAction;

#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum AppUpdate {
    /// Primary update stream: always a full state snapshot.
    FullState(AppState),
    /// The active conversation's list changed while auto-follow was on; the view should
    /// snap to the newest message.
    ScrollToNewest { rev: u64, chat_id: String },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::ScrollToNewest { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
    Shutdown,
}

/// Why a message fetch was issued. Poll and refresh results are dropped when their
/// generation is no longer the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Load { generation: u64 },
    Poll { generation: u64 },
    Refresh { generation: u64 },
}

impl FetchOrigin {
    pub fn generation(self) -> u64 {
        match self {
            FetchOrigin::Load { generation }
            | FetchOrigin::Poll { generation }
            | FetchOrigin::Refresh { generation } => generation,
        }
    }
}

#[derive(Debug)]
pub enum InternalEvent {
    // Directory
    ConversationsFetched {
        user_id: String,
        result: Result<Vec<Conversation>, BackendError>,
    },

    // Sync
    PollTick {
        chat_id: String,
        generation: u64,
    },
    MessagesFetched {
        chat_id: String,
        origin: FetchOrigin,
        result: Result<Vec<Message>, BackendError>,
    },

    // Send path
    MessageSendResult {
        session: u64,
        chat_id: String,
        local_id: String,
        result: Result<Message, BackendError>,
    },
    AttachmentUploaded {
        chat_id: String,
        local_id: String,
        index: usize,
        result: Result<UploadedResource, BackendError>,
    },

    ToastAutoDismiss {
        token: u64,
    },
}
