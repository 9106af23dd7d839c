use std::path::PathBuf;

/// A file the user picked for sending. Name and MIME type are guessed from the path
/// when not given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub path: PathBuf,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            mime_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppAction {
    // Session
    SetUser {
        user_id: String,
    },
    ClearUser,

    // Conversations
    RefreshConversations,
    OpenConversation {
        chat_id: String,
    },
    CloseConversation,
    RefreshMessages,

    // Sending
    SendMessage {
        chat_id: String,
        content: String,
    },
    SendAttachments {
        chat_id: String,
        caption: String,
        files: Vec<FileHandle>,
    },
    RetryMessage {
        chat_id: String,
        message_id: String,
    },
    DiscardMessage {
        chat_id: String,
        message_id: String,
    },

    // Viewport
    ViewportScrolled {
        chat_id: String,
        scroll_top: f64,
        scroll_height: f64,
        viewport_height: f64,
    },
    JumpToNewest {
        chat_id: String,
    },

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes message content).
    pub fn tag(&self) -> &'static str {
        match self {
            // Session
            AppAction::SetUser { .. } => "SetUser",
            AppAction::ClearUser => "ClearUser",

            // Conversations
            AppAction::RefreshConversations => "RefreshConversations",
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",
            AppAction::RefreshMessages => "RefreshMessages",

            // Sending
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::SendAttachments { .. } => "SendAttachments",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::DiscardMessage { .. } => "DiscardMessage",

            // Viewport
            AppAction::ViewportScrolled { .. } => "ViewportScrolled",
            AppAction::JumpToNewest { .. } => "JumpToNewest",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
        }
    }
}
