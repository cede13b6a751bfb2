use std::sync::RwLock;

use tracing::warn;

/// Confirmation prompts the watcher answers. Matching is case-insensitive.
pub const PROMPT_PATTERNS: &[&str] = &[
    "[y/n]",
    "[Y/n]",
    "[y/N]",
    "(y/n)",
    "(Y/n)",
    "(y/N)",
    "Continue? [y/n]",
    "Proceed? [y/n]",
    "Are you sure",
];

/// Line written to the PTY when a prompt is detected.
pub const AFFIRMATIVE: &str = "y";

/// Return the first pattern found in `chunk`, if any.
///
/// Only the chunk itself is inspected: a prompt split across two PTY reads
/// is not detected.
pub fn detect(chunk: &[u8]) -> Option<&'static str> {
    if chunk.is_empty() {
        return None;
    }
    let haystack = String::from_utf8_lossy(chunk).to_lowercase();
    PROMPT_PATTERNS
        .iter()
        .copied()
        .find(|pattern| haystack.contains(&pattern.to_lowercase()))
}

/// Enabled flag for a session's watcher, behind its own lock so toggling
/// never contends with the byte-forwarding path.
#[derive(Debug, Default)]
pub struct PromptWatcher {
    enabled: RwLock<bool>,
}

impl PromptWatcher {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: RwLock::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read().unwrap_or_else(|e| {
            warn!("prompt watcher lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write().unwrap_or_else(|e| {
            warn!("prompt watcher lock was poisoned, recovering");
            e.into_inner()
        }) = enabled;
    }

    /// Pattern to answer in `chunk`, or `None` when disabled or no match.
    pub fn check(&self, chunk: &[u8]) -> Option<&'static str> {
        if self.is_enabled() {
            detect(chunk)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_continue_prompt() {
        assert!(detect(b"Downloading...\r\nContinue? [y/n] ").is_some());
    }

    #[test]
    fn detection_is_case_insensitive() {
        assert_eq!(detect(b"Overwrite file? [Y/N]"), Some("[y/n]"));
        assert_eq!(detect(b"ARE YOU SURE you want to delete?"), Some("Are you sure"));
        assert_eq!(detect(b"remove it (y/N)?"), Some("(y/n)"));
    }

    #[test]
    fn plain_output_does_not_match() {
        assert_eq!(detect(b"total 48\r\ndrwxr-xr-x  5 user staff"), None);
        assert_eq!(detect(b""), None);
        assert_eq!(detect(b"yes/no"), None);
    }

    #[test]
    fn split_prompt_is_not_detected() {
        assert_eq!(detect(b"Continue? [y"), None);
        assert_eq!(detect(b"/n]"), None);
    }

    #[test]
    fn disabled_watcher_never_matches() {
        let watcher = PromptWatcher::new(false);
        assert_eq!(watcher.check(b"Proceed? [y/n]"), None);
        watcher.set_enabled(true);
        assert!(watcher.is_enabled());
        assert!(watcher.check(b"Proceed? [y/n]").is_some());
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        let mut chunk = vec![0xff, 0xfe];
        chunk.extend_from_slice(b"[y/n]");
        assert!(detect(&chunk).is_some());
    }
}
