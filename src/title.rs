//! Window title prefix management.
//!
//! Holds a prefix the client wants prepended to whatever title the remote
//! host sets via OSC 0/2; not on any latency-sensitive path.

use crate::terminal::Framebuffer;

/// Tracks and applies a window-title prefix.
#[derive(Debug, Default, Clone)]
pub struct TitleEngine {
    prefix: Vec<char>,
}

impl TitleEngine {
    pub fn new() -> Self {
        Self { prefix: Vec::new() }
    }

    /// Replace the prefix with the code points of `s`.
    pub fn set_prefix(&mut self, s: &str) {
        self.prefix = s.chars().collect();
    }

    /// Install `prefix` ahead of the framebuffer's current title.
    pub fn apply(&self, fb: &mut Framebuffer) {
        if self.prefix.is_empty() {
            return;
        }
        let prefix: String = self.prefix.iter().collect();
        if !fb.title.starts_with(&prefix) {
            fb.title = format!("{}{}", prefix, fb.title);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_prefix_is_applied_once() {
        let mut title = TitleEngine::new();
        title.set_prefix("[mosh] ");
        let mut fb = Framebuffer::new(80, 24);
        fb.title = "bash".to_string();
        title.apply(&mut fb);
        assert_eq!(fb.title, "[mosh] bash");

        // Applying again shouldn't double the prefix.
        title.apply(&mut fb);
        assert_eq!(fb.title, "[mosh] bash");
    }

    #[test]
    fn empty_prefix_leaves_title_untouched() {
        let title = TitleEngine::new();
        let mut fb = Framebuffer::new(80, 24);
        fb.title = "zsh".to_string();
        title.apply(&mut fb);
        assert_eq!(fb.title, "zsh");
    }
}
