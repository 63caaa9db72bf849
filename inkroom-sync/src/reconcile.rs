//! Last-writer-wins merge of remote elements into a local scene.
//!
//! For each remote element `r` with a local counterpart `l`:
//!
//! ```text
//! r.version  >  l.version              → take r
//! r.version  <  l.version              → keep l
//! equal version, r.updated > l.updated → take r
//! equal version, r.updated < l.updated → keep l
//! equal version and updated:
//!     r.nonce != l.nonce               → take r
//!     r.nonce == l.nonce               → keep l (same revision)
//! ```
//!
//! Elements only present locally are kept and ids are never dropped;
//! deletions travel as tombstones and are arbitrated like any other edit.

use crate::element::{Element, Scene};
use std::cmp::Ordering;

/// Whether `remote` should replace `local`.
#[inline]
pub fn prefers_remote(local: &Element, remote: &Element) -> bool {
    match remote.version.cmp(&local.version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match remote.updated.partial_cmp(&local.updated) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => remote.version_nonce != local.version_nonce,
        },
    }
}

/// Merge `remote` into a copy of `local`.
///
/// Remote entries are applied in order against the running result, so a
/// later entry for the same id is arbitrated against whichever revision won
/// before it. Never fails.
pub fn reconcile(local: &Scene, remote: &[Element]) -> Scene {
    let mut merged = local.clone();
    reconcile_into(&mut merged, remote);
    merged
}

/// In-place variant of [`reconcile`]. Returns how many remote entries won.
pub fn reconcile_into(scene: &mut Scene, remote: &[Element]) -> usize {
    let mut taken = 0;
    for incoming in remote {
        let take = scene
            .get(&incoming.id)
            .map_or(true, |current| prefers_remote(current, incoming));
        if take {
            scene.upsert(incoming.clone());
            taken += 1;
        }
    }
    taken
}
