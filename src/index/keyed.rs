//! Maps keyed by address during pass 1 and by id once identifiers are frozen

use super::identifiers::Identifiers;
use crate::model::ObjectId;
use rustc_hash::FxHashMap;

/// Values keyed by object address. Only valid before identifiers are frozen.
#[derive(Debug, Clone)]
pub struct AddressKeyed<T> {
    map: FxHashMap<u64, T>,
}

impl<T> Default for AddressKeyed<T> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }
}

impl<T> AddressKeyed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u64, value: T) -> Option<T> {
        self.map.insert(address, value)
    }

    pub fn get(&self, address: u64) -> Option<&T> {
        self.map.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut T> {
        self.map.get_mut(&address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.map.contains_key(&address)
    }

    pub fn entry_or_default(&mut self, address: u64) -> &mut T
    where
        T: Default,
    {
        self.map.entry(address).or_default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.map.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.map.values_mut()
    }

    /// Re-key by id. Entries whose address is not an identifier are returned separately.
    pub fn into_id_keyed(self, identifiers: &Identifiers) -> (IdKeyed<T>, Vec<(u64, T)>) {
        let mut keyed = IdKeyed::with_capacity(self.map.len());
        let mut unresolved = Vec::new();
        for (address, value) in self.map {
            match identifiers.id_of(address) {
                Some(id) => {
                    keyed.insert(id, value);
                }
                None => unresolved.push((address, value)),
            }
        }
        (keyed, unresolved)
    }
}

/// Values keyed by object id, available after identifiers are frozen
#[derive(Debug, Clone)]
pub struct IdKeyed<T> {
    map: FxHashMap<ObjectId, T>,
}

impl<T> FromIterator<(ObjectId, T)> for IdKeyed<T> {
    fn from_iter<I: IntoIterator<Item = (ObjectId, T)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

impl<T> Default for IdKeyed<T> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }
}

impl<T> IdKeyed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    pub fn insert(&mut self, id: ObjectId, value: T) -> Option<T> {
        self.map.insert(id, value)
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        self.map.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &T)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.map.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.map.values_mut()
    }

    /// Ids in ascending order
    pub fn sorted_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Entries in ascending id order
    pub fn into_sorted_vec(self) -> Vec<(ObjectId, T)> {
        let mut entries: Vec<(ObjectId, T)> = self.map.into_iter().collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}
