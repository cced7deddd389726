//! Address -> id table

use crate::model::ObjectId;
use rayon::slice::ParallelSliceMut;

/// Collects (address, file position) pairs during pass 1
#[derive(Debug, Default)]
pub struct IdentifierBuilder {
    entries: Vec<(u64, u64)>,
    sorted: bool,
}

impl IdentifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address with the position of its record, 0 when it has none
    pub fn add(&mut self, address: u64, position: u64) {
        self.entries.push((address, position));
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort by address and collapse duplicates, keeping the earliest position.
    /// Returns the number of duplicates removed.
    pub fn sort(&mut self) -> usize {
        if self.sorted {
            return 0;
        }
        self.entries.par_sort_unstable();
        let before = self.entries.len();
        self.entries.dedup_by_key(|(address, _)| *address);
        self.sorted = true;
        before - self.entries.len()
    }

    /// Binary search; call [`sort`](Self::sort) first
    pub fn contains(&self, address: u64) -> bool {
        debug_assert!(self.sorted, "identifier table must be sorted");
        self.entries
            .binary_search_by_key(&address, |(a, _)| *a)
            .is_ok()
    }

    /// Sorted addresses; call [`sort`](Self::sort) first
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        debug_assert!(self.sorted, "identifier table must be sorted");
        self.entries.iter().map(|(a, _)| *a)
    }

    /// Freeze into the immutable table plus the id-ordered file positions
    pub fn freeze(mut self) -> (Identifiers, Vec<u64>) {
        self.sort();
        let (addresses, positions) = self.entries.into_iter().unzip();
        (Identifiers { addresses }, positions)
    }
}

/// Sorted, immutable address table. An object's id is its rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifiers {
    addresses: Vec<u64>,
}

impl Identifiers {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    #[inline]
    pub fn id_of(&self, address: u64) -> Option<ObjectId> {
        self.addresses
            .binary_search(&address)
            .ok()
            .map(|index| index as ObjectId)
    }

    #[inline]
    pub fn address_of(&self, id: ObjectId) -> Option<u64> {
        self.addresses.get(id as usize).copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_collapses_duplicates() {
        let mut builder = IdentifierBuilder::new();
        builder.add(0x40, 400);
        builder.add(0x10, 100);
        builder.add(0x40, 401);
        builder.add(0, 0);
        assert_eq!(builder.sort(), 1);
        assert!(builder.contains(0x40));
        assert!(!builder.contains(0x20));
        assert_eq!(builder.addresses().collect::<Vec<_>>(), vec![0, 0x10, 0x40]);

        let (identifiers, positions) = builder.freeze();
        assert_eq!(identifiers.len(), 3);
        assert_eq!(positions, vec![0, 100, 400]);
    }

    #[test]
    fn test_id_address_bijection() {
        let mut builder = IdentifierBuilder::new();
        for address in [0x900u64, 0x18, 0x0, 0x7f0, 0x20] {
            builder.add(address, address * 2);
        }
        let (identifiers, _) = builder.freeze();
        for id in 0..identifiers.len() as ObjectId {
            let address = identifiers.address_of(id).unwrap();
            assert_eq!(identifiers.id_of(address), Some(id));
        }
        assert_eq!(identifiers.id_of(0x19), None);
        assert_eq!(identifiers.address_of(5), None);
    }
}
