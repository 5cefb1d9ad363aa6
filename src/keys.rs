//! Store key layout.
//!
//! Every room maps to exactly three keys derived from the process-wide
//! prefix and the room name: a snapshot hash, a history list, and a pub/sub
//! channel. Pattern names keep their `*` so the derived hash and list keys
//! stay usable as scan patterns.

/// Returns true if `name` is a pattern (contains the `*` wildcard).
pub fn is_pattern(name: &str) -> bool {
    name.contains('*')
}

/// The three store keys for one room name.
///
/// Literal and pattern names use the same formulas; whether the channel key
/// is used with SUBSCRIBE or PSUBSCRIBE is decided at subscription time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    snapshot: String,
    history: String,
    channel: String,
}

impl KeySet {
    /// Derive the key triple for `name` under `prefix`.
    pub fn new(prefix: &str, name: &str) -> Self {
        Self {
            snapshot: format!("{prefix}:{name}:hash"),
            history: format!("{prefix}:{name}:list"),
            channel: format!("{prefix}:{name}:channel"),
        }
    }

    /// Key of the snapshot hash (field to last-written value).
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Key of the history list (newest-first raw payloads).
    pub fn history(&self) -> &str {
        &self.history
    }

    /// Name of the pub/sub channel updates fan out on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_key_triple() {
        let keys = KeySet::new("room", "match:42");
        assert_eq!(keys.snapshot(), "room:match:42:hash");
        assert_eq!(keys.history(), "room:match:42:list");
        assert_eq!(keys.channel(), "room:match:42:channel");
    }

    #[test]
    fn test_pattern_keeps_wildcard() {
        let keys = KeySet::new("room", "match:*");
        assert_eq!(keys.snapshot(), "room:match:*:hash");
        assert_eq!(keys.history(), "room:match:*:list");
        assert_eq!(keys.channel(), "room:match:*:channel");
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("p:*"));
        assert!(is_pattern("*"));
        assert!(!is_pattern("p:a"));
        assert!(!is_pattern(""));
    }
}
