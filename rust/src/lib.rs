mod actions;
pub mod backend;
mod core;
mod logging;
pub mod model;
mod state;
mod updates;
pub mod wire;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::Context;
use flume::{Receiver, Sender};

pub use actions::{AppAction, FileHandle};
pub use backend::{BackendError, ChatBackend};
pub use crate::core::config::{read_app_config, AppConfig, ConfigError};
pub use crate::core::should_auto_follow;
pub use model::{AttachmentKind, DeliveryStatus, MessageKind};
pub use state::*;
pub use updates::*;

pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

/// Handle to the engine. The engine itself runs as a single-threaded actor; every call
/// here is non-blocking.
pub struct ChatApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

impl ChatApp {
    /// Start with logging, config and backend taken from `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref();
        logging::init_logging(data_dir);
        let config = crate::core::config::load_app_config(data_dir);
        Self::with_config(data_dir, config)
    }

    /// Like [`ChatApp::new`], but with a config the caller already assembled (e.g. file
    /// values overridden from the command line).
    pub fn with_config(data_dir: impl AsRef<Path>, config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref();
        logging::init_logging(data_dir);
        tracing::info!(data_dir = %data_dir.display(), "ChatApp starting");

        config.validate().context("invalid config")?;
        let backend = backend::from_config(&config).context("configure backend")?;
        Self::with_backend(config, backend)
    }

    /// Start against an explicit backend (tests, embedding hosts).
    pub fn with_backend(
        config: AppConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> anyhow::Result<Arc<Self>> {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        let mut core = crate::core::AppCore::new(
            update_tx,
            core_tx.clone(),
            shared_state.clone(),
            config,
            backend,
        )?;

        // Actor loop thread (single threaded "app actor").
        thread::Builder::new()
            .name("chatsync-core".into())
            .spawn(move || {
                while let Ok(msg) = core_rx.recv() {
                    if !core.handle_message(msg) {
                        break;
                    }
                }
            })
            .context("spawn core thread")?;

        Ok(Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        }))
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
    }
}
