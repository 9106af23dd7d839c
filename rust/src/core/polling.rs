// Poll timer ownership for the active conversation.
//
// There is never more than one armed `PollTimer`: `activate` drops the previous handle
// (which aborts its task) before spawning the next one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::updates::{CoreMsg, InternalEvent};

/// Owned handle to a repeating poll timer. Dropping it cancels the timer.
pub(crate) struct PollTimer {
    task: JoinHandle<()>,
    _live: LiveGuard,
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActivePoll {
    chat_id: String,
    generation: u64,
    fetch_in_flight: bool,
    _timer: PollTimer,
}

pub(crate) struct PollScheduler {
    interval: Duration,
    generation: u64,
    active: Option<ActivePoll>,
    live: Arc<AtomicUsize>,
}

impl PollScheduler {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            generation: 0,
            active: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the timer to `chat_id` and return the new generation.
    pub(crate) fn activate(&mut self, runtime: &Handle, chat_id: &str, tx: Sender<CoreMsg>) -> u64 {
        if let Some(previous) = self.deactivate() {
            tracing::debug!(from = %previous, to = %chat_id, "poll: rebinding");
        }
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let timer = spawn_timer(
            runtime,
            chat_id.to_string(),
            generation,
            self.interval,
            tx,
            LiveGuard::new(&self.live),
        );
        self.active = Some(ActivePoll {
            chat_id: chat_id.to_string(),
            generation,
            fetch_in_flight: false,
            _timer: timer,
        });
        tracing::info!(%chat_id, generation, interval_ms = self.interval.as_millis() as u64, "poll: armed");
        generation
    }

    /// Cancel the timer, if any. Returns the conversation it was bound to.
    pub(crate) fn deactivate(&mut self) -> Option<String> {
        let active = self.active.take()?;
        tracing::info!(chat_id = %active.chat_id, generation = active.generation, "poll: cancelled");
        Some(active.chat_id)
    }

    pub(crate) fn is_current(&self, chat_id: &str, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation && a.chat_id == chat_id)
    }

    pub(crate) fn active_chat_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.chat_id.as_str())
    }

    pub(crate) fn current_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.generation)
    }

    /// Claim the poll fetch slot. False when stale or a fetch is already outstanding.
    pub(crate) fn begin_fetch(&mut self, chat_id: &str, generation: u64) -> bool {
        match self.active.as_mut() {
            Some(a) if a.generation == generation && a.chat_id == chat_id => {
                if a.fetch_in_flight {
                    return false;
                }
                a.fetch_in_flight = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn end_fetch(&mut self, generation: u64) {
        if let Some(a) = self.active.as_mut() {
            if a.generation == generation {
                a.fetch_in_flight = false;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_timers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

fn spawn_timer(
    runtime: &Handle,
    chat_id: String,
    generation: u64,
    interval: Duration,
    tx: Sender<CoreMsg>,
    live: LiveGuard,
) -> PollTimer {
    let task = runtime.spawn(async move {
        // The initial load covers t=0; first tick is one interval out.
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let tick = CoreMsg::Internal(Box::new(InternalEvent::PollTick {
                chat_id: chat_id.clone(),
                generation,
            }));
            if tx.send(tick).is_err() {
                break;
            }
        }
    });
    PollTimer { task, _live: live }
}
