//! Process-wide hash-consing tables.
//!
//! Cells are interned by content hash with a shallow structural compare on
//! collision; children are always interned before their parent is looked
//! up, so the table lock is never taken re-entrantly. Interned cells live
//! for the rest of the process.

use std::sync::Arc;

use hashbrown::HashMap;

/// A hash-consing table for DAG cells of type `C`.
pub(crate) struct Interner<C> {
    next_id: u64,
    buckets: HashMap<u64, Vec<Arc<C>>>,
}

impl<C> Interner<C> {
    pub(crate) fn new() -> Self {
        Interner {
            next_id: 1,
            buckets: HashMap::new(),
        }
    }

    /// Return the unique cell with the given content hash for which
    /// `matches` holds (checked against `payload`), building it with
    /// `build` (which receives the fresh cell id and `payload`) on a miss.
    pub(crate) fn intern<P>(
        &mut self,
        hash: u64,
        payload: P,
        matches: impl Fn(&C, &P) -> bool,
        build: impl FnOnce(u64, P) -> C,
    ) -> Arc<C> {
        let bucket = self.buckets.entry(hash).or_default();
        for cell in bucket.iter() {
            if matches(cell, &payload) {
                return Arc::clone(cell);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        let cell = Arc::new(build(id, payload));
        bucket.push(Arc::clone(&cell));
        cell
    }
}
