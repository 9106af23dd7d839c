// Auto-follow bookkeeping for the open conversation.

pub(crate) const DEFAULT_AUTO_FOLLOW_THRESHOLD_PX: f64 = 100.0;

/// True when the viewport's bottom edge is within `threshold` of the content's bottom.
pub fn should_auto_follow(
    scroll_top: f64,
    scroll_height: f64,
    viewport_height: f64,
    threshold: f64,
) -> bool {
    let distance = scroll_height - scroll_top - viewport_height;
    distance < threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowDecision {
    SnapToNewest,
    ShowNewMessages { unseen: u32 },
}

#[derive(Debug)]
struct FollowState {
    chat_id: String,
    auto_follow: bool,
    unseen: u32,
}

#[derive(Debug)]
pub(crate) struct ViewportController {
    threshold: f64,
    current: Option<FollowState>,
}

impl ViewportController {
    pub(crate) fn new(threshold: f64) -> Self {
        Self {
            threshold,
            current: None,
        }
    }

    /// Start tracking `chat_id` with auto-follow on.
    pub(crate) fn reset(&mut self, chat_id: &str) {
        self.current = Some(FollowState {
            chat_id: chat_id.to_string(),
            auto_follow: true,
            unseen: 0,
        });
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
    }

    pub(crate) fn on_scroll(
        &mut self,
        chat_id: &str,
        scroll_top: f64,
        scroll_height: f64,
        viewport_height: f64,
    ) -> bool {
        let threshold = self.threshold;
        let Some(state) = self.tracking_mut(chat_id) else {
            return false;
        };
        let follow = should_auto_follow(scroll_top, scroll_height, viewport_height, threshold);
        let changed = follow != state.auto_follow || (follow && state.unseen > 0);
        state.auto_follow = follow;
        if follow {
            state.unseen = 0;
        }
        changed
    }

    /// React to a store mutation on `chat_id`. `None` when that chat is not the one shown.
    pub(crate) fn on_mutation(&mut self, chat_id: &str, inserted: usize) -> Option<FollowDecision> {
        let state = self.tracking_mut(chat_id)?;
        if state.auto_follow {
            return Some(FollowDecision::SnapToNewest);
        }
        state.unseen = state
            .unseen
            .saturating_add(u32::try_from(inserted).unwrap_or(u32::MAX));
        Some(FollowDecision::ShowNewMessages {
            unseen: state.unseen,
        })
    }

    pub(crate) fn jump_to_newest(&mut self, chat_id: &str) -> bool {
        let Some(state) = self.tracking_mut(chat_id) else {
            return false;
        };
        state.auto_follow = true;
        state.unseen = 0;
        true
    }

    pub(crate) fn auto_follow(&self) -> bool {
        self.current.as_ref().map_or(true, |s| s.auto_follow)
    }

    pub(crate) fn unseen(&self) -> u32 {
        self.current.as_ref().map(|s| s.unseen).unwrap_or(0)
    }

    fn tracking_mut(&mut self, chat_id: &str) -> Option<&mut FollowState> {
        self.current.as_mut().filter(|s| s.chat_id == chat_id)
    }
}
