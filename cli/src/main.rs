use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use chatsync_core::{
    read_app_config, AppAction, AppReconciler, AppState, AppUpdate, ChatApp, ChatMessage,
    FileHandle,
};
use clap::{Parser, Subcommand};
use flume::{Receiver, Sender};

#[derive(Debug, Parser)]
#[command(name = "chatsync", about = "Talk to a chat backend through the sync engine")]
struct Cli {
    /// Directory holding chatsync_config.json and chatsync.log.
    #[arg(long, env = "CHATSYNC_DATA_DIR", default_value = ".chatsync")]
    data_dir: PathBuf,

    /// Overrides `api_base_url` from the config file.
    #[arg(long, env = "CHATSYNC_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "CHATSYNC_USER")]
    user: String,

    /// How long to wait for the backend before giving up.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List conversations, most recent first.
    Conversations,
    /// Open a conversation and print messages as they arrive.
    Watch { chat_id: String },
    /// Send a message, optionally with attachments, and wait for the outcome.
    Send {
        chat_id: String,
        text: String,
        #[arg(long = "attach")]
        attach: Vec<PathBuf>,
    },
}

struct Forward(Sender<AppUpdate>);

impl AppReconciler for Forward {
    fn reconcile(&self, update: AppUpdate) {
        let _ = self.0.send(update);
    }
}

struct Session {
    app: std::sync::Arc<ChatApp>,
    updates: Receiver<AppUpdate>,
    timeout: Duration,
}

impl Session {
    fn start(cli: &Cli) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cli.data_dir)
            .with_context(|| format!("create {}", cli.data_dir.display()))?;
        let mut config = read_app_config(&cli.data_dir)?.unwrap_or_default();
        if let Some(url) = &cli.api_url {
            config.api_base_url = Some(url.clone());
            config.disable_network = Some(false);
        }
        let app = ChatApp::with_config(&cli.data_dir, config)?;

        let (tx, updates) = flume::unbounded();
        app.listen_for_updates(Box::new(Forward(tx)));
        app.dispatch(AppAction::SetUser {
            user_id: cli.user.clone(),
        });
        Ok(Self {
            app,
            updates,
            timeout: Duration::from_secs(cli.timeout_secs),
        })
    }

    /// Block until a snapshot satisfies `done`, printing toasts along the way.
    fn wait_for(
        &self,
        what: &str,
        mut done: impl FnMut(&AppState) -> bool,
    ) -> anyhow::Result<AppState> {
        let current = self.app.state();
        if done(&current) {
            return Ok(current);
        }
        let deadline = Instant::now() + self.timeout;
        let mut last_toast = current.toast;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let update = self
                .updates
                .recv_timeout(left)
                .map_err(|_| anyhow!("timed out waiting for {what}"))?;
            let AppUpdate::FullState(state) = update else {
                continue;
            };
            if state.toast.is_some() && state.toast != last_toast {
                eprintln!("! {}", state.toast.as_deref().unwrap_or_default());
            }
            last_toast = state.toast.clone();
            if done(&state) {
                return Ok(state);
            }
        }
    }

    fn directory(&self) -> anyhow::Result<AppState> {
        self.wait_for("conversations", |s| {
            s.user_id.is_some() && s.rev > 0 && !s.busy.loading_conversations
        })
    }

    fn open(&self, chat_id: &str) -> anyhow::Result<AppState> {
        self.app.dispatch(AppAction::OpenConversation {
            chat_id: chat_id.to_string(),
        });
        self.wait_for("messages", |s| {
            s.current_chat.as_ref().is_some_and(|c| c.chat_id == chat_id)
                && !s.busy.loading_messages
        })
    }
}

fn print_message(m: &ChatMessage) {
    let marker = match (&m.failure_reason, m.in_flight) {
        (Some(_), _) => "x",
        (None, true) => "~",
        (None, false) => " ",
    };
    println!(
        "{marker} [{}] {}: {}",
        m.display_timestamp, m.sender_id, m.content
    );
    for a in &m.attachments {
        println!("    + {} ({})", a.name, a.mime_type);
    }
}

fn conversations(session: &Session) -> anyhow::Result<()> {
    let state = session.directory()?;
    for c in &state.conversations {
        println!(
            "{}\t{}\t{}\t{}",
            c.chat_id, c.display_name, c.recency, c.last_message_preview
        );
    }
    Ok(())
}

fn watch(session: &Session, chat_id: &str) -> anyhow::Result<()> {
    session.directory()?;
    let state = session.open(chat_id)?;
    let mut seen = HashSet::new();
    let mut show = |state: &AppState| {
        let Some(chat) = &state.current_chat else {
            return;
        };
        for m in &chat.messages {
            if m.in_flight {
                continue;
            }
            if seen.insert(m.id.clone()) {
                print_message(m);
            }
        }
    };
    show(&state);
    tracing::info!(%chat_id, "cli: watching");
    while let Ok(update) = session.updates.recv() {
        if let AppUpdate::FullState(state) = update {
            show(&state);
        }
    }
    Ok(())
}

fn send(
    session: &Session,
    chat_id: &str,
    text: String,
    attach: Vec<PathBuf>,
) -> anyhow::Result<()> {
    session.directory()?;
    let before = session.open(chat_id)?;
    let known: HashSet<String> = before
        .current_chat
        .iter()
        .flat_map(|c| c.messages.iter().map(|m| m.id.clone()))
        .collect();

    let action = if attach.is_empty() {
        AppAction::SendMessage {
            chat_id: chat_id.to_string(),
            content: text,
        }
    } else {
        AppAction::SendAttachments {
            chat_id: chat_id.to_string(),
            caption: text,
            files: attach.into_iter().map(FileHandle::new).collect(),
        }
    };
    session.app.dispatch(action);

    let settled = |s: &AppState| -> Option<ChatMessage> {
        s.current_chat.as_ref()?.messages.iter().find_map(|m| {
            (m.is_mine && !m.in_flight && !known.contains(&m.id)).then(|| m.clone())
        })
    };
    let state = session.wait_for("send", |s| settled(s).is_some())?;
    let Some(message) = settled(&state) else {
        bail!("message vanished");
    };
    if let Some(reason) = &message.failure_reason {
        bail!("send failed: {reason}");
    }
    print_message(&message);
    println!("{}", message.id);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let res = Session::start(&cli).and_then(|session| match &cli.cmd {
        Cmd::Conversations => conversations(&session),
        Cmd::Watch { chat_id } => watch(&session, chat_id),
        Cmd::Send {
            chat_id,
            text,
            attach,
        } => send(&session, chat_id, text.clone(), attach.clone()),
    });
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
