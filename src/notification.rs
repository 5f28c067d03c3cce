//! Top-of-screen notification bar: connection status and transient messages.
//!
//! Draws a one-row bar across row 0 of the framebuffer when there is a
//! message to show the user, or when the client has gone too long without
//! hearing from the server ("contact-age countup"). Mirrors the framebuffer's
//! own grapheme-rendering rules since it writes cells directly.

use crate::terminal::{Attributes, Cell, Color, Framebuffer};

/// How long since the last datagram from the server before we start
/// counting up "last contact N seconds ago" in the bar.
const CONTACT_AGE_THRESHOLD_MS: u64 = 6000;

/// Default lifetime of a user-set message.
const DEFAULT_MESSAGE_LIFETIME_MS: u64 = 10_000;

/// Sentinel meaning "no message currently set".
const NO_EXPIRATION: u64 = u64::MAX;

/// Connection-status and transient-message overlay.
pub struct NotificationEngine {
    last_word_from_server: u64,
    message: String,
    message_expiration: u64,
}

impl NotificationEngine {
    pub fn new(now: u64) -> Self {
        Self {
            last_word_from_server: now,
            message: String::new(),
            message_expiration: NO_EXPIRATION,
        }
    }

    /// True once the client has gone more than the contact-age threshold
    /// without hearing from the server.
    pub fn need_countup(&self, now: u64) -> bool {
        now.saturating_sub(self.last_word_from_server) > CONTACT_AGE_THRESHOLD_MS
    }

    /// Called by the network layer whenever a datagram arrives from the server.
    pub fn server_heard(&mut self, now: u64) {
        self.last_word_from_server = now;
    }

    /// Set a user-visible message with a default expiration.
    pub fn set_message(&mut self, message: impl Into<String>, now: u64) {
        self.message = message.into();
        self.message_expiration = now + DEFAULT_MESSAGE_LIFETIME_MS;
    }

    /// Clear any active message immediately.
    pub fn clear_message(&mut self) {
        self.message.clear();
        self.message_expiration = NO_EXPIRATION;
    }

    /// Raw expiration timestamp, consumed by `OverlayManager::wait_time`.
    pub fn get_message_expiration(&self) -> u64 {
        self.message_expiration
    }

    /// Clear the message once its expiration has passed.
    pub fn adjust_message(&mut self, now: u64) {
        if now >= self.message_expiration {
            self.message.clear();
            self.message_expiration = NO_EXPIRATION;
        }
    }

    /// Draw the bar into row 0 of `fb`, if there's anything to show.
    pub fn apply(&self, fb: &mut Framebuffer, now: u64) {
        let time_expired = self.need_countup(now);

        if self.message.is_empty() && !time_expired {
            return;
        }

        if fb.width == 0 || fb.height == 0 {
            return;
        }

        if fb.cursor_row == 0 {
            fb.cursor_visible = false;
        }

        let bar_fg = Color::Indexed(7);
        let bar_bg = Color::Indexed(4);

        for col in 0..fb.width {
            fb.cells[0][col] = Cell {
                character: ' ',
                fg: bar_fg,
                bg: bar_bg,
                dirty: true,
                ..Cell::default()
            };
        }

        let seconds_since_contact = (now.saturating_sub(self.last_word_from_server)) as f64 / 1000.0;
        let text = match (self.message.is_empty(), time_expired) {
            (true, true) => format!(
                "mosh: Last contact {:.0} seconds ago. [To quit: Ctrl-^ .]",
                seconds_since_contact
            ),
            (false, false) => format!("mosh: {} [To quit: Ctrl-^ .]", self.message),
            (false, true) => format!(
                "mosh: {} ({:.0} s without contact.) [To quit: Ctrl-^ .]",
                self.message, seconds_since_contact
            ),
            (true, false) => return,
        };

        self.write_graphemes(fb, &text, bar_fg, bar_bg);
    }

    /// Walk `text` one code point at a time, splitting it into grapheme
    /// cells the same way the framebuffer's own VT parser would: wide glyphs
    /// advance two columns, combining marks fold into the preceding cell.
    fn write_graphemes(&self, fb: &mut Framebuffer, text: &str, fg: Color, bg: Color) {
        use unicode_width::UnicodeWidthChar;

        let mut col = 0usize;
        let mut last_cell: Option<usize> = None;

        for ch in text.chars() {
            if col >= fb.width {
                break;
            }

            let width = match UnicodeWidthChar::width(ch) {
                Some(w) => w as isize,
                None => -1,
            };

            match width {
                1 | 2 => {
                    let w = width as u8;
                    fb.cells[0][col] = Cell {
                        character: ch,
                        width: w,
                        fg,
                        bg,
                        attrs: Attributes {
                            bold: true,
                            ..Attributes::default()
                        },
                        dirty: true,
                        ..Cell::default()
                    };
                    last_cell = Some(col);
                    col += width as usize;
                }
                0 => {
                    if let Some(idx) = last_cell {
                        let cell = &mut fb.cells[0][idx];
                        if cell.is_blank() {
                            cell.fallback = true;
                            col += 1;
                        }
                        if cell.extra.len() < 15 {
                            cell.extra.push(ch);
                        }
                        cell.dirty = true;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nothing_with_no_message_and_recent_contact() {
        let engine = NotificationEngine::new(0);
        let mut fb = Framebuffer::new(40, 10);
        engine.apply(&mut fb, 100);
        assert!(fb.cells[0].iter().all(|c| c.character == ' ' && c.fg == Color::Default));
    }

    #[test]
    fn renders_countup_after_silence_threshold() {
        let engine = NotificationEngine::new(0);
        let mut fb = Framebuffer::new(80, 10);
        engine.apply(&mut fb, CONTACT_AGE_THRESHOLD_MS + 1000);
        assert_eq!(fb.cells[0][0].character, 'm');
        assert_eq!(fb.cells[0][0].fg, Color::Indexed(7));
        assert_eq!(fb.cells[0][0].bg, Color::Indexed(4));
    }

    #[test]
    fn message_overrides_bar_even_without_countup() {
        let mut engine = NotificationEngine::new(0);
        engine.set_message("connecting...", 0);
        let mut fb = Framebuffer::new(80, 10);
        engine.apply(&mut fb, 10);
        assert_eq!(fb.cells[0][0].character, 'm');
        assert_eq!(fb.cells[0][6].character, 'c');
    }

    #[test]
    fn adjust_message_clears_after_expiration() {
        let mut engine = NotificationEngine::new(0);
        engine.set_message("hi", 0);
        engine.adjust_message(DEFAULT_MESSAGE_LIFETIME_MS + 1);
        assert_eq!(engine.get_message_expiration(), NO_EXPIRATION);
    }

    #[test]
    fn server_heard_resets_contact_age() {
        let mut engine = NotificationEngine::new(0);
        engine.server_heard(5000);
        assert!(!engine.need_countup(5000 + CONTACT_AGE_THRESHOLD_MS - 1));
        assert!(engine.need_countup(5000 + CONTACT_AGE_THRESHOLD_MS + 1));
    }

    #[test]
    fn combining_mark_folds_into_preceding_cell() {
        let mut engine = NotificationEngine::new(0);
        engine.set_message("e\u{301}", 0);
        let mut fb = Framebuffer::new(80, 10);
        engine.apply(&mut fb, 10);
        // "mosh: e<acute> [To quit..." - the accented 'e' lands after "mosh: "
        assert_eq!(fb.cells[0][6].character, 'e');
        assert_eq!(fb.cells[0][6].extra, vec!['\u{301}']);
    }

    #[test]
    fn hides_cursor_when_on_row_zero() {
        let mut engine = NotificationEngine::new(0);
        engine.set_message("hi", 0);
        let mut fb = Framebuffer::new(80, 10);
        fb.cursor_row = 0;
        fb.cursor_visible = true;
        engine.apply(&mut fb, 10);
        assert!(!fb.cursor_visible);
    }
}
