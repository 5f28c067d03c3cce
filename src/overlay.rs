//! Composes the prediction, notification and title overlays onto a
//! framebuffer, and tells the event loop how long it can sleep before the
//! next overlay-relevant deadline.

use crate::notification::NotificationEngine;
use crate::prediction::{PredictionEngine, PredictionMode};
use crate::terminal::Framebuffer;
use crate::title::TitleEngine;

/// Upper bound used when no overlay has an opinion on wakeup timing.
const NO_DEADLINE_MS: u64 = 1_000_000;

/// Owns one of each overlay engine and applies them in the order the
/// display actually depends on: predictions first (most latency-sensitive),
/// then the notification bar, then the title.
pub struct OverlayManager {
    pub predictions: PredictionEngine,
    pub notifications: NotificationEngine,
    pub title: TitleEngine,
}

impl OverlayManager {
    pub fn new(mode: PredictionMode, width: usize, height: usize, now: u64) -> Self {
        Self {
            predictions: PredictionEngine::new(mode, width, height),
            notifications: NotificationEngine::new(now),
            title: TitleEngine::new(),
        }
    }

    /// Cull stale predictions against the latest server framebuffer, then
    /// draw predictions, the notification bar and the title onto `fb`.
    ///
    /// Returns the predicted cursor position, if any prediction wants to
    /// override the framebuffer's own cursor.
    pub fn apply(&mut self, fb: &mut Framebuffer, now: u64) -> Option<(usize, usize)> {
        self.predictions.cull(fb);
        let predicted_cursor = self.predictions.apply_overlays(fb);
        self.notifications.adjust_message(now);
        self.notifications.apply(fb, now);
        self.title.apply(fb);
        predicted_cursor
    }

    /// Longest the outer event loop may sleep before it must re-render.
    pub fn wait_time(&self, now: u64) -> u64 {
        let mut next = NO_DEADLINE_MS;

        let expiration = self.notifications.get_message_expiration();
        let message_delay = expiration.saturating_sub(now);
        if message_delay < next {
            next = message_delay;
        }

        if self.notifications.need_countup(now) && next > 1000 {
            next = 1000;
        }

        if self.predictions.has_predictions() && next > 20 {
            next = 20;
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_time_shortens_when_predictions_active() {
        let mut manager = OverlayManager::new(PredictionMode::Always, 80, 24, 0);
        let fb = Framebuffer::new(80, 24);
        manager.predictions.set_local_frame_sent(0);
        manager.predictions.new_user_input_batch(b"x", &fb);
        assert!(manager.wait_time(0) <= 20);
    }

    #[test]
    fn wait_time_defaults_large_when_idle() {
        let manager = OverlayManager::new(PredictionMode::Never, 80, 24, 0);
        assert!(manager.wait_time(0) >= 1000);
    }

    #[test]
    fn apply_composes_predictions_notifications_and_title() {
        let mut manager = OverlayManager::new(PredictionMode::Always, 80, 24, 0);
        manager.title.set_prefix("[mosh] ");
        manager.notifications.set_message("connecting", 0);

        let mut fb = Framebuffer::new(80, 24);
        fb.title = "bash".to_string();
        manager.apply(&mut fb, 0);

        assert_eq!(fb.title, "[mosh] bash");
        assert_eq!(fb.cells[0][0].character, 'm');
    }
}
