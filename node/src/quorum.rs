// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The external tie-breaker that decides which node of the pair may be live.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// A lock or vote service reachable by both nodes.
///
/// `has_leadership` must be answered from the service's current view, never
/// from a cache: fencing relies on it.
pub trait QuorumSignal: Send + Sync {
    /// Whether `node` holds leadership right now.
    fn has_leadership(&self, node: &str) -> bool;

    /// Asks for leadership on behalf of `node`. Granted only when nobody
    /// reachable holds it. Returns whether `node` holds it afterwards.
    fn try_acquire(&self, node: &str) -> bool;

    /// Gives up leadership held by `node`, so the peer can acquire it.
    /// Returns whether `node` held it.
    fn release(&self, node: &str) -> bool;

    /// Change notifications, for services that can push them. Each change
    /// bumps the counter.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

#[derive(Debug, Default)]
struct QuorumView {
    holder: Option<String>,
    unreachable: HashSet<String>,
}

/// Single-holder lock service kept in memory. Embedders use it when both
/// nodes share a process; tests use it to cut a node off from the quorum.
pub struct InMemoryQuorum {
    view: Mutex<QuorumView>,
    changes: watch::Sender<u64>,
}

impl InMemoryQuorum {
    pub fn new(holder: Option<&str>) -> Self {
        let view = QuorumView { holder: holder.map(str::to_string), unreachable: HashSet::new() };
        Self { view: Mutex::new(view), changes: watch::channel(0).0 }
    }

    fn update(&self, f: impl FnOnce(&mut QuorumView)) {
        f(&mut self.view.lock().unwrap_or_else(PoisonError::into_inner));
        self.changes.send_modify(|n| *n += 1);
    }

    /// The service can no longer see `node`.
    pub fn partition(&self, node: &str) {
        self.update(|view| {
            view.unreachable.insert(node.to_string());
        });
    }

    pub fn heal(&self, node: &str) {
        self.update(|view| {
            view.unreachable.remove(node);
        });
    }

    /// Operator override of the holder.
    pub fn assign(&self, node: Option<&str>) {
        self.update(|view| view.holder = node.map(str::to_string));
    }

    pub fn holder(&self) -> Option<String> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner).holder.clone()
    }
}

impl QuorumSignal for InMemoryQuorum {
    fn has_leadership(&self, node: &str) -> bool {
        let view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        view.holder.as_deref() == Some(node) && !view.unreachable.contains(node)
    }

    fn try_acquire(&self, node: &str) -> bool {
        let granted = {
            let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            if view.unreachable.contains(node) {
                return false;
            }
            match view.holder.as_deref() {
                Some(holder) if holder == node => return true,
                Some(holder) if !view.unreachable.contains(holder) => false,
                _ => {
                    view.holder = Some(node.to_string());
                    true
                }
            }
        };
        if granted {
            tracing::info!(node, "quorum granted leadership");
            self.changes.send_modify(|n| *n += 1);
        }
        granted
    }

    fn release(&self, node: &str) -> bool {
        let released = {
            let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            if view.holder.as_deref() == Some(node) && !view.unreachable.contains(node) {
                view.holder = None;
                true
            } else {
                false
            }
        };
        if released {
            tracing::info!(node, "leadership released");
            self.changes.send_modify(|n| *n += 1);
        }
        released
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leadership_moves_only_when_holder_is_unreachable() {
        let quorum = InMemoryQuorum::new(Some("a"));
        assert!(quorum.has_leadership("a"));
        assert!(!quorum.try_acquire("b"));

        quorum.partition("a");
        assert!(!quorum.has_leadership("a"));
        assert!(quorum.try_acquire("b"));
        assert_eq!(quorum.holder().as_deref(), Some("b"));

        // back on the network, the old holder stays out
        quorum.heal("a");
        assert!(!quorum.has_leadership("a"));
        assert!(!quorum.try_acquire("a"));
    }

    #[test]
    fn test_partitioned_node_cannot_acquire() {
        let quorum = InMemoryQuorum::new(None);
        quorum.partition("b");
        assert!(!quorum.try_acquire("b"));
        assert!(quorum.try_acquire("a"));
    }

    #[test]
    fn test_only_the_holder_can_release() {
        let quorum = InMemoryQuorum::new(Some("a"));
        assert!(!quorum.release("b"));
        assert!(quorum.has_leadership("a"));

        assert!(quorum.release("a"));
        assert_eq!(quorum.holder(), None);
        assert!(!quorum.release("a"));
        assert!(quorum.try_acquire("b"));
    }

    #[test]
    fn test_changes_are_pushed() {
        let quorum = InMemoryQuorum::new(Some("a"));
        let mut changes = quorum.subscribe().unwrap();
        quorum.partition("a");
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);
    }
}
