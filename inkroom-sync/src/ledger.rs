//! Last-seen version of every element, used to suppress echoes.
//!
//! The ledger answers one question: has this element changed since we last
//! broadcast it or received it from a peer? Elements applied from the network
//! are recorded so the resulting local change notification does not bounce
//! them straight back.

use crate::element::{Element, VersionStamp};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct VersionLedger {
    stamps: HashMap<String, VersionStamp>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_version(&mut self, element: &Element) {
        self.stamps.insert(element.id.clone(), element.stamp());
    }

    pub fn record_all<'a>(&mut self, elements: impl IntoIterator<Item = &'a Element>) {
        for element in elements {
            self.record_version(element);
        }
    }

    /// True when the element is unknown or its `(version, nonce)` differs
    /// from the recorded one.
    pub fn has_changed(&self, element: &Element) -> bool {
        self.stamps
            .get(&element.id)
            .map_or(true, |stamp| *stamp != element.stamp())
    }

    /// The changed subset of `elements`, recording each one as seen.
    pub fn collect_changes(&mut self, elements: &[Element]) -> Vec<Element> {
        let changed: Vec<Element> = elements
            .iter()
            .filter(|e| self.has_changed(e))
            .cloned()
            .collect();
        self.record_all(&changed);
        changed
    }

    pub fn get(&self, id: &str) -> Option<VersionStamp> {
        self.stamps.get(id).copied()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_element_has_changed() {
        let ledger = VersionLedger::new();
        assert!(ledger.has_changed(&Element::new("a", 1, 1, 0.0)));
    }

    #[test]
    fn test_recorded_element_unchanged_until_stamp_moves() {
        let mut ledger = VersionLedger::new();
        let element = Element::new("a", 1, 1, 0.0);
        ledger.record_version(&element);
        assert!(!ledger.has_changed(&element));

        // `updated` alone does not count as a change
        assert!(!ledger.has_changed(&Element::new("a", 1, 1, 99.0)));
        assert!(ledger.has_changed(&Element::new("a", 2, 1, 0.0)));
        assert!(ledger.has_changed(&Element::new("a", 1, 2, 0.0)));
    }

    #[test]
    fn test_collect_changes_records() {
        let mut ledger = VersionLedger::new();
        ledger.record_version(&Element::new("a", 1, 1, 0.0));

        let scene = vec![
            Element::new("a", 1, 1, 0.0),
            Element::new("b", 1, 1, 0.0),
            Element::new("c", 3, 1, 0.0),
        ];
        let changed = ledger.collect_changes(&scene);
        let ids: Vec<_> = changed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        assert!(ledger.collect_changes(&scene).is_empty());
        assert_eq!(ledger.len(), 3);
        assert_eq!(
            ledger.get("c"),
            Some(VersionStamp { version: 3, version_nonce: 1 })
        );
    }

    #[test]
    fn test_clear() {
        let mut ledger = VersionLedger::new();
        ledger.record_all(&[Element::new("a", 1, 1, 0.0), Element::new("b", 1, 1, 0.0)]);
        assert_eq!(ledger.len(), 2);
        ledger.clear();
        assert!(ledger.is_empty());
    }
}
