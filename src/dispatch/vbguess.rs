// SPDX-License-Identifier: MIT OR Apache-2.0

//! Heuristic vbucket remap hints.
//!
//! When a node answers NOT_MY_VBUCKET, the authoritative config may still
//! be seconds away. Until it lands, this table remembers which node
//! rejected which vbucket so routing can steer follow-up traffic at a
//! different candidate. Hints are evidence, not truth: the whole table is
//! dropped the moment a new config is accepted, and a hint is ignored as
//! soon as the map itself stops pointing at the rejecting node.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct VbGuess {
    rejected: Mutex<HashMap<u16, usize>>,
}

impl VbGuess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `index` claimed not to own `vbucket`.
    pub fn record_reject(&self, vbucket: u16, index: usize) {
        self.rejected
            .lock()
            .expect("vbguess lock")
            .insert(vbucket, index);
    }

    /// Alternative pipeline index to try, if the current map still routes
    /// `vbucket` at a node known to have rejected it.
    #[must_use]
    pub fn lookup(
        &self,
        vbucket: u16,
        mapped_master: Option<usize>,
        npipelines: usize,
    ) -> Option<usize> {
        if npipelines < 2 {
            return None;
        }
        let rejected = *self.rejected.lock().expect("vbguess lock").get(&vbucket)?;
        if mapped_master != Some(rejected) {
            // The map moved on; the hint is stale.
            return None;
        }
        Some((rejected + 1) % npipelines)
    }

    /// Drop every hint; called when an authoritative config arrives.
    pub fn clear(&self) {
        self.rejected.lock().expect("vbguess lock").clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rejected.lock().expect("vbguess lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_redirects_away_from_rejector() {
        let guess = VbGuess::new();
        guess.record_reject(12, 0);
        assert_eq!(guess.lookup(12, Some(0), 3), Some(1));
    }

    #[test]
    fn test_hint_ignored_when_map_moved() {
        let guess = VbGuess::new();
        guess.record_reject(12, 0);
        // The map already routes vb 12 at node 2.
        assert_eq!(guess.lookup(12, Some(2), 3), None);
    }

    #[test]
    fn test_no_hint_for_single_node() {
        let guess = VbGuess::new();
        guess.record_reject(5, 0);
        assert_eq!(guess.lookup(5, Some(0), 1), None);
    }

    #[test]
    fn test_clear_on_new_config() {
        let guess = VbGuess::new();
        guess.record_reject(1, 0);
        guess.record_reject(2, 1);
        assert_eq!(guess.len(), 2);
        guess.clear();
        assert!(guess.is_empty());
        assert_eq!(guess.lookup(1, Some(0), 2), None);
    }

    #[test]
    fn test_wraparound() {
        let guess = VbGuess::new();
        guess.record_reject(9, 2);
        assert_eq!(guess.lookup(9, Some(2), 3), Some(0));
    }
}
