//! Client-side overlays that aren't part of the host's own output: a status
//! line reporting how long it's been since the server was last heard from,
//! and a window-title prefix showing connection state.

use std::time::{Duration, Instant};

use crate::cell::{Cell, Color, Renditions};
use crate::framebuffer::Framebuffer;
use crate::prediction::PredictionEngine;

const NEED_COUNTUP_THRESHOLD: Duration = Duration::from_millis(6500);

fn human_readable_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs} second{}", if secs == 1 { "" } else { "s" })
    } else if secs < 3600 {
        let mins = secs / 60;
        format!("{mins} minute{}", if mins == 1 { "" } else { "s" })
    } else {
        let hours = secs / 3600;
        format!("{hours} hour{}", if hours == 1 { "" } else { "s" })
    }
}

/// Draws a one-line status bar reporting elapsed time since the last
/// server message, plus any explicit message set via [`set_notification_string`].
pub struct NotificationEngine {
    last_word_from_server: Instant,
    message: String,
    message_expiration: Option<Instant>,
    message_is_error: bool,
}

impl NotificationEngine {
    pub fn new(now: Instant) -> Self {
        Self {
            last_word_from_server: now,
            message: String::new(),
            message_expiration: None,
            message_is_error: false,
        }
    }

    pub fn server_heard(&mut self, now: Instant) {
        self.last_word_from_server = now;
    }

    pub fn set_notification_string(&mut self, s: String, is_error: bool, expiration: Option<Instant>) {
        self.message = s;
        self.message_is_error = is_error;
        self.message_expiration = expiration;
    }

    pub fn get_notification_string(&self) -> &str {
        &self.message
    }

    /// Clears an expired message; called once per frame before `apply`.
    pub fn adjust_message(&mut self, now: Instant) {
        if let Some(exp) = self.message_expiration {
            if now >= exp {
                self.message.clear();
                self.message_expiration = None;
            }
        }
    }

    /// How long the client can safely wait before the status line's
    /// elapsed-time display goes stale, so the caller can schedule a
    /// repaint even with no other activity.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let since = now.saturating_duration_since(self.last_word_from_server);
        if since < NEED_COUNTUP_THRESHOLD {
            NEED_COUNTUP_THRESHOLD - since
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn apply(&self, fb: &mut Framebuffer, now: Instant) {
        let since = now.saturating_duration_since(self.last_word_from_server);
        if self.message.is_empty() && since < NEED_COUNTUP_THRESHOLD {
            return;
        }

        let text = if !self.message.is_empty() {
            self.message.clone()
        } else {
            format!("mosh: Last contact {} ago.", human_readable_duration(since))
        };

        let bar_rendition = Renditions {
            fg: Color::Palette(7),
            bg: Color::Palette(if self.message_is_error { 1 } else { 4 }),
            ..Renditions::default()
        };

        if fb.height() == 0 {
            return;
        }

        let width = fb.width();
        let row = fb.row_mut(0);
        for col in 0..width {
            let cell = row.cell_mut(col);
            *cell = Cell::blank();
            cell.renditions = bar_rendition;
        }
        for (col, ch) in text.chars().enumerate() {
            if col >= width {
                break;
            }
            let cell = row.cell_mut(col);
            cell.set_character(ch);
            cell.renditions = bar_rendition;
        }
    }
}

/// Prefixes the window title with `[mosh]` (or a similar marker) while
/// connected; set once at startup.
#[derive(Default)]
pub struct TitleEngine {
    prefix: String,
}

impl TitleEngine {
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn apply(&self, fb: &mut Framebuffer) {
        if !self.prefix.is_empty() {
            fb.prefix_window_title(&self.prefix);
        }
    }
}

/// Composes the prediction engine with the two client-only overlays into a
/// single apply/cull entry point for the display loop.
pub struct OverlayManager {
    pub predictions: PredictionEngine,
    pub notifications: NotificationEngine,
    pub title: TitleEngine,
}

impl OverlayManager {
    pub fn new(now: Instant) -> Self {
        Self {
            predictions: PredictionEngine::new(),
            notifications: NotificationEngine::new(now),
            title: TitleEngine::default(),
        }
    }

    /// Applies every overlay to a copy of the real framebuffer. Called once
    /// per outgoing frame; the real framebuffer itself is never mutated.
    pub fn apply(&mut self, fb: &Framebuffer, now: Instant) -> Framebuffer {
        self.predictions.cull(fb, now);
        self.notifications.adjust_message(now);

        let mut shown = fb.clone();
        self.predictions.apply(&mut shown);
        self.notifications.apply(&mut shown, now);
        self.title.apply(&mut shown);
        shown
    }

    pub fn wait_time(&self, now: Instant) -> Duration {
        self.notifications.wait_time(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_shows_no_status_bar() {
        let now = Instant::now();
        let engine = NotificationEngine::new(now);
        let mut fb = Framebuffer::new(10, 3);
        engine.apply(&mut fb, now);
        assert!(fb.row(0).cell(0).is_blank());
    }

    #[test]
    fn explicit_message_is_drawn() {
        let now = Instant::now();
        let mut engine = NotificationEngine::new(now);
        engine.set_notification_string("hello".to_string(), false, None);
        let mut fb = Framebuffer::new(10, 3);
        engine.apply(&mut fb, now);
        assert_eq!(fb.row(0).cell(0).contents(), &['h']);
    }

    #[test]
    fn title_engine_prefixes_once() {
        let mut title = TitleEngine::default();
        title.set_prefix("[mosh] ");
        let mut fb = Framebuffer::new(10, 3);
        fb.set_window_title("bash".to_string());
        title.apply(&mut fb);
        title.apply(&mut fb);
        assert_eq!(fb.window_title, "[mosh] bash");
    }
}
