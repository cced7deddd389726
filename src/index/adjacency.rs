//! Random-access outbound adjacency

use crate::model::ObjectId;

/// Read-only id -> ids adjacency consumed by the marker
pub trait Adjacency: Sync {
    fn object_count(&self) -> usize;

    /// Call `f` for each outbound id of `id`, in stored order
    fn for_each_outbound<F: FnMut(ObjectId)>(&self, id: ObjectId, f: F);

    /// Approximate bytes occupied by the adjacency data
    fn footprint_bytes(&self) -> u64;

    fn outbound(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.for_each_outbound(id, |target| out.push(target));
        out
    }
}

/// In-memory adjacency, one list per id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjacencyList {
    lists: Vec<Vec<ObjectId>>,
}

impl AdjacencyList {
    pub fn new(object_count: usize) -> Self {
        Self {
            lists: vec![Vec::new(); object_count],
        }
    }

    pub fn from_lists(lists: Vec<Vec<ObjectId>>) -> Self {
        Self { lists }
    }

    pub fn add_edge(&mut self, from: ObjectId, to: ObjectId) {
        self.lists[from as usize].push(to);
    }

    pub fn set(&mut self, id: ObjectId, targets: Vec<ObjectId>) {
        self.lists[id as usize] = targets;
    }
}

impl Adjacency for AdjacencyList {
    fn object_count(&self) -> usize {
        self.lists.len()
    }

    fn for_each_outbound<F: FnMut(ObjectId)>(&self, id: ObjectId, mut f: F) {
        if let Some(list) = self.lists.get(id as usize) {
            for &target in list {
                f(target);
            }
        }
    }

    fn footprint_bytes(&self) -> u64 {
        self.lists
            .iter()
            .map(|l| (l.len() * 4 + std::mem::size_of::<Vec<ObjectId>>()) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency_list() {
        let mut graph = AdjacencyList::new(3);
        graph.add_edge(0, 1);
        graph.add_edge(0, 2);
        graph.set(2, vec![0]);
        assert_eq!(graph.object_count(), 3);
        assert_eq!(graph.outbound(0), vec![1, 2]);
        assert!(graph.outbound(1).is_empty());
        assert_eq!(graph.outbound(2), vec![0]);
        // out of range ids have no edges
        assert!(graph.outbound(7).is_empty());
    }
}
