//! Subscription registry
//!
//! Tracks which patterns the module wants and which are subscribed on the
//! live connection. The registry holds no transport: it tells the
//! [`Bus`](crate::Bus) what to subscribe and the bus performs the calls.
//!
//! ## Lifecycle of a pattern
//!
//! ```text
//!  add (disconnected) ──► wanted ──replay (connect)──► subscribed
//!  add (connected) ─────────────────────────────────► subscribed
//!                           ▲                              │
//!                           └──── suspend (conn. lost) ────┘
//! ```
//!
//! A pattern is in at most one of the two lists. Both keep registration
//! order, which is also the order the router tries patterns in.

use crate::topic;

/// What the caller must do after [`SubscriptionRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Subscribe on the live connection now
    SubscribeNow,
    /// Recorded, will be subscribed on the next connect
    Deferred,
    /// Already tracked, nothing to do
    AlreadyTracked,
}

/// Wanted and subscribed patterns of one module
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    wanted: Vec<String>,
    subscribed: Vec<String>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a pattern
    ///
    /// # Parameters
    ///
    /// - `pattern`: Subscription pattern
    /// - `connected`: Whether the broker connection is up
    pub fn add(&mut self, pattern: &str, connected: bool) -> Registration {
        if self.is_tracked(pattern) {
            return Registration::AlreadyTracked;
        }

        if connected {
            self.subscribed.push(pattern.to_string());
            Registration::SubscribeNow
        } else {
            self.wanted.push(pattern.to_string());
            Registration::Deferred
        }
    }

    /// Stop tracking a pattern
    ///
    /// Returns `true` if the pattern was subscribed on the live connection
    /// and must be unsubscribed.
    pub fn remove(&mut self, pattern: &str) -> bool {
        self.wanted.retain(|p| p != pattern);
        let before = self.subscribed.len();
        self.subscribed.retain(|p| p != pattern);
        self.subscribed.len() != before
    }

    /// Move every wanted pattern to the subscribed list
    ///
    /// Returns the moved patterns in registration order; the caller
    /// subscribes each of them.
    pub fn replay(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.wanted);
        self.subscribed.extend(pending.iter().cloned());
        pending
    }

    /// Move every subscribed pattern back to the wanted list
    ///
    /// Called when the connection drops so the next connect replays them.
    pub fn suspend(&mut self) {
        let mut wanted = std::mem::take(&mut self.subscribed);
        wanted.append(&mut self.wanted);
        self.wanted = wanted;
    }

    /// First subscribed pattern, in registration order, matching `concrete`
    pub fn first_match(&self, concrete: &str) -> Option<&str> {
        self.subscribed
            .iter()
            .find(|pattern| topic::matches(pattern, concrete))
            .map(String::as_str)
    }

    /// Whether the pattern is in either list
    pub fn is_tracked(&self, pattern: &str) -> bool {
        self.is_subscribed(pattern) || self.wanted.iter().any(|p| p == pattern)
    }

    /// Whether the pattern is subscribed on the live connection
    pub fn is_subscribed(&self, pattern: &str) -> bool {
        self.subscribed.iter().any(|p| p == pattern)
    }

    /// Patterns waiting for the next connect
    pub fn wanted(&self) -> &[String] {
        &self.wanted
    }

    /// Patterns subscribed on the live connection
    pub fn subscribed(&self) -> &[String] {
        &self.subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_adds_are_deferred_and_deduplicated() {
        let mut registry = SubscriptionRegistry::new();

        assert_eq!(registry.add("a/+", false), Registration::Deferred);
        assert_eq!(registry.add("b/#", false), Registration::Deferred);
        assert_eq!(registry.add("a/+", false), Registration::AlreadyTracked);

        assert_eq!(registry.wanted(), ["a/+", "b/#"]);
        assert!(registry.subscribed().is_empty());
    }

    #[test]
    fn replay_moves_wanted_in_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a/+", false);
        registry.add("b/#", false);

        assert_eq!(registry.replay(), vec!["a/+", "b/#"]);
        assert!(registry.wanted().is_empty());
        assert_eq!(registry.subscribed(), ["a/+", "b/#"]);
        assert!(registry.replay().is_empty());
    }

    #[test]
    fn online_add_subscribes_once() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.add("a/+", true), Registration::SubscribeNow);
        assert_eq!(registry.add("a/+", true), Registration::AlreadyTracked);
        assert_eq!(registry.subscribed(), ["a/+"]);
    }

    #[test]
    fn suspend_puts_subscribed_first() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a/+", true);
        registry.add("b/+", true);
        registry.suspend();
        registry.add("c/+", false);

        assert!(registry.subscribed().is_empty());
        assert_eq!(registry.replay(), vec!["a/+", "b/+", "c/+"]);
    }

    #[test]
    fn remove_reports_live_subscriptions() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a/+", true);
        registry.add("b/+", false);

        assert!(registry.remove("a/+"));
        assert!(!registry.remove("b/+"));
        assert!(!registry.remove("never/added"));
        assert!(!registry.is_tracked("b/+"));
    }

    #[test]
    fn first_match_uses_registration_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a/+/c", true);
        registry.add("a/b/+", true);

        assert_eq!(registry.first_match("a/b/c"), Some("a/+/c"));
        assert_eq!(registry.first_match("a/b/d"), Some("a/b/+"));
        assert_eq!(registry.first_match("x/y/z"), None);
    }
}
