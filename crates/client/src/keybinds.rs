//! Prefix key table
//!
//! After the prefix byte (Ctrl+B), the next keystroke selects an action.
//! Defaults can be overridden by an optional `keybinds.conf` in the runtime
//! directory: whitespace-separated tokens, `#` starts a comment, lines of
//! the form `prefix <key-char> <action-name>`. Unknown action names are
//! ignored.

use std::path::Path;

/// The prefix byte: Ctrl+B.
pub const PREFIX_KEY: u8 = 0x02;

/// Actions reachable through the prefix table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixAction {
    DetachSession,
    NewPane,
    NextPane,
    ScrollUp,
    ScrollDown,
}

impl PrefixAction {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "detach_session" => Self::DetachSession,
            "new_pane" => Self::NewPane,
            "next_pane" => Self::NextPane,
            "scroll_up" => Self::ScrollUp,
            "scroll_down" => Self::ScrollDown,
            _ => return None,
        })
    }
}

/// Key-to-action table consulted after the prefix.
#[derive(Debug, Clone)]
pub struct Keybinds {
    entries: Vec<(u8, PrefixAction)>,
}

impl Default for Keybinds {
    fn default() -> Self {
        Self {
            entries: vec![
                (b'd', PrefixAction::DetachSession),
                (b'%', PrefixAction::NewPane),
                (b'o', PrefixAction::NextPane),
                (b'[', PrefixAction::ScrollUp),
                (b']', PrefixAction::ScrollDown),
            ],
        }
    }
}

impl Keybinds {
    /// Defaults, overlaid with whatever `path` defines (if it exists).
    pub fn load(path: &Path) -> Self {
        let mut binds = Self::default();
        let Ok(contents) = std::fs::read_to_string(path) else {
            return binds;
        };
        binds.merge(&contents);
        binds
    }

    /// Apply `prefix <key> <action>` lines from a config body.
    pub fn merge(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("prefix") {
                continue;
            }
            let (Some(key), Some(action)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            let Some(key) = key.bytes().next() else {
                continue;
            };
            let Some(action) = PrefixAction::parse(action) else {
                tracing::debug!(action, "unknown keybind action ignored");
                continue;
            };
            self.bind(key, action);
        }
    }

    fn bind(&mut self, key: u8, action: PrefixAction) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = action,
            None => self.entries.push((key, action)),
        }
    }

    /// Look up the literal key byte. The caller lowercases alphabetic keys
    /// first; symbols like `%` match literally.
    pub fn lookup(&self, key: u8) -> Option<PrefixAction> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, a)| *a)
    }
}
