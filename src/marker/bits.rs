//! Caller-owned reachability bits shared by marker threads

use crate::model::ObjectId;
use std::sync::atomic::{AtomicBool, Ordering};

/// One flag per object id. Flags are only ever set, never cleared, and all
/// accesses are relaxed: threads may observe a flag late, which only costs a
/// redundant look at an object.
#[derive(Debug)]
pub struct ReachabilitySet {
    bits: Vec<AtomicBool>,
}

impl ReachabilitySet {
    pub fn new(object_count: usize) -> Self {
        Self {
            bits: (0..object_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn is_marked(&self, id: ObjectId) -> bool {
        self.bits[id as usize].load(Ordering::Relaxed)
    }

    /// Set the flag of `id`; true if this call set it
    #[inline]
    pub fn mark(&self, id: ObjectId) -> bool {
        let bit = &self.bits[id as usize];
        !bit.load(Ordering::Relaxed) && !bit.swap(true, Ordering::Relaxed)
    }

    pub fn count_marked(&self) -> usize {
        self.bits
            .iter()
            .filter(|b| b.load(Ordering::Relaxed))
            .count()
    }

    /// Ids of every marked object, ascending
    pub fn marked_ids(&self) -> Vec<ObjectId> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| b.load(Ordering::Relaxed))
            .map(|(id, _)| id as ObjectId)
            .collect()
    }

    pub fn to_vec(&self) -> Vec<bool> {
        self.bits.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

impl From<Vec<bool>> for ReachabilitySet {
    fn from(bits: Vec<bool>) -> Self {
        Self {
            bits: bits.into_iter().map(AtomicBool::new).collect(),
        }
    }
}
