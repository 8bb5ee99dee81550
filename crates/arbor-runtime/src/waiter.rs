//! Wait registrations: clients that want to hear about state changes.
//!
//! A waiter carries name patterns (with `*`/`?` wildcards) and an optional
//! label filter, and delivers through a bounded channel. Containers hold
//! weak references; a client that dropped its receiver is swept lazily.
//! Delivery is at-least-once per matching transition.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use arbor_common::types::ContainerState;

/// One delivered wait notification. An empty name signals a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEvent {
    /// Container path, empty on timeout.
    pub name: String,
    /// State at notification time.
    pub state: Option<ContainerState>,
}

/// A registered wait.
#[derive(Debug)]
pub struct Waiter {
    targets: Vec<String>,
    wildcards: Vec<String>,
    labels: Vec<String>,
    tx: Mutex<SyncSender<WaitEvent>>,
}

impl Waiter {
    /// Creates a waiter for the given patterns; returns the receiving end
    /// the client blocks on.
    #[must_use]
    pub fn new(patterns: Vec<String>, labels: Vec<String>) -> (std::sync::Arc<Self>, Receiver<WaitEvent>) {
        let (tx, rx) = sync_channel(64);
        let (wildcards, targets) = patterns
            .into_iter()
            .partition(|p| p.contains('*') || p.contains('?'));
        let waiter = std::sync::Arc::new(Self {
            targets,
            wildcards,
            labels,
            tx: Mutex::new(tx),
        });
        (waiter, rx)
    }

    /// Exact-name targets this waiter should be registered on.
    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Whether the waiter carries wildcard patterns.
    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        !self.wildcards.is_empty()
    }

    /// Whether a container name matches one of the wildcard patterns.
    #[must_use]
    pub fn matches_wildcard(&self, name: &str) -> bool {
        self.wildcards.iter().any(|p| glob_match(p, name))
    }

    /// Delivers a notification if the label filter admits the container.
    /// `has_label` answers whether the container carries a label key.
    pub fn wake<F: Fn(&str) -> bool>(&self, name: &str, state: ContainerState, has_label: F) {
        if !self.labels.is_empty() && !self.labels.iter().any(|l| has_label(l)) {
            return;
        }
        self.deliver(WaitEvent {
            name: name.to_string(),
            state: Some(state),
        });
    }

    /// Delivers the timeout notification: an empty container name.
    pub fn wake_timeout(&self) {
        self.deliver(WaitEvent {
            name: String::new(),
            state: None,
        });
    }

    fn deliver(&self, event: WaitEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.try_send(event) {
            Ok(()) => {}
            // a slow or gone client loses notifications, not the daemon
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                tracing::debug!("wait notification dropped");
            }
        }
    }
}

/// Shell-style pattern match supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = name.chars().collect();
    // iterative backtracking over the last star
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (usize::MAX, 0usize);
    while t < text.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = p;
            star_t = t;
            p += 1;
        } else if star != usize::MAX {
            p = star + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(glob_match("*", "anything/at/all"));
        assert!(glob_match("a/*", "a/b"));
        assert!(glob_match("a/*", "a/b/c"));
        assert!(!glob_match("a/*", "b/c"));
        assert!(glob_match("job-?", "job-1"));
        assert!(!glob_match("job-?", "job-10"));
        assert!(glob_match("*-web-*", "prod-web-3"));
        assert!(!glob_match("", "x"));
        assert!(glob_match("", ""));
    }

    #[test]
    fn patterns_are_partitioned() {
        let (waiter, _rx) = Waiter::new(
            vec!["a".to_string(), "b/*".to_string()],
            Vec::new(),
        );
        assert_eq!(waiter.targets(), ["a".to_string()]);
        assert!(waiter.has_wildcards());
        assert!(waiter.matches_wildcard("b/c"));
        assert!(!waiter.matches_wildcard("a"));
    }

    #[test]
    fn wake_delivers_and_timeout_is_empty() {
        let (waiter, rx) = Waiter::new(vec!["a".to_string()], Vec::new());
        waiter.wake("a", ContainerState::Dead, |_| false);
        let event = rx.try_recv().expect("event");
        assert_eq!(event.name, "a");
        assert_eq!(event.state, Some(ContainerState::Dead));

        waiter.wake_timeout();
        let event = rx.try_recv().expect("timeout event");
        assert!(event.name.is_empty());
    }

    #[test]
    fn label_filter_gates_delivery() {
        let (waiter, rx) = Waiter::new(vec!["a".to_string()], vec!["app.tier".to_string()]);
        waiter.wake("a", ContainerState::Dead, |_| false);
        assert!(rx.try_recv().is_err());
        waiter.wake("a", ContainerState::Dead, |key| key == "app.tier");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn dropped_receiver_does_not_wedge_delivery() {
        let (waiter, rx) = Waiter::new(vec!["a".to_string()], Vec::new());
        drop(rx);
        waiter.wake("a", ContainerState::Stopped, |_| false);
    }
}
