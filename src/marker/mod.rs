//! Reachability marking over the outbound adjacency
//!
//! Marks every object reachable from a root set in a caller-owned
//! [`ReachabilitySet`]. Marking is idempotent: objects already marked are
//! neither counted nor traversed again, so a cancelled run can be repeated
//! on the same set.

pub mod bits;
pub mod exclude;
pub mod memory;
pub mod root_stack;
mod worker;

pub use bits::ReachabilitySet;
pub use exclude::{ExcludedReferences, NamedReferences};
pub use memory::{locality_size, MemoryProbe};

use crate::config::MarkerConfig;
use crate::index::Adjacency;
use crate::model::ObjectId;
use crate::progress::Monitor;
use crate::snapshot::HeapIndex;
use crate::{HeapError, HeapResult};
use exclude::ExclusionFilter;
use root_stack::SharedRootStack;
use tracing::{debug, info};
use worker::{Window, Worker};

const TASK_NAME: &str = "Marking reachable objects";

/// How a marking run is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOptions {
    /// Worker threads; 0 or 1 marks on the calling thread
    pub threads: usize,
    /// Keep each worker within an id window sized from available memory
    pub locality: bool,
    /// Memory assumed free when sizing windows; system memory when unset
    pub memory_budget_mb: Option<u64>,
}

impl Default for MarkOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            locality: false,
            memory_budget_mb: None,
        }
    }
}

impl From<&MarkerConfig> for MarkOptions {
    fn from(config: &MarkerConfig) -> Self {
        Self {
            threads: config.effective_threads(),
            locality: config.locality,
            memory_budget_mb: config.memory_budget_mb,
        }
    }
}

/// Marks objects reachable from `roots`
pub struct ObjectMarker<'a, A> {
    roots: &'a [ObjectId],
    bits: &'a ReachabilitySet,
    adjacency: &'a A,
    monitor: Monitor<'a>,
}

impl<'a, A: Adjacency> ObjectMarker<'a, A> {
    pub fn new(
        roots: &'a [ObjectId],
        bits: &'a ReachabilitySet,
        adjacency: &'a A,
        monitor: Monitor<'a>,
    ) -> HeapResult<Self> {
        let count = adjacency.object_count();
        if bits.len() != count {
            return Err(HeapError::BitsetSizeMismatch {
                bits: bits.len(),
                objects: count,
            });
        }
        if let Some(&id) = roots.iter().find(|&&id| id as usize >= count) {
            return Err(HeapError::InvalidObjectId { id, count });
        }
        Ok(Self {
            roots,
            bits,
            adjacency,
            monitor,
        })
    }

    /// Single-threaded when `threads <= 1`, otherwise shared-stack workers
    pub fn mark(&self, options: &MarkOptions) -> HeapResult<u64> {
        if options.threads <= 1 {
            return self.mark_single_threaded();
        }
        if options.locality {
            let memory = MemoryProbe::from_budget_mb(options.memory_budget_mb);
            self.mark_multi_threaded(options.threads, Some(&memory))
        } else {
            self.mark_multi_threaded(options.threads, None)
        }
    }

    /// Depth-first marking on the calling thread. Returns the number of
    /// objects newly marked, roots included.
    pub fn mark_single_threaded(&self) -> HeapResult<u64> {
        self.depth_first(|_, _| Ok(true))
    }

    /// Mark with `threads` workers. With `memory`, each worker prefers ids in
    /// a window sized from the free memory it reports.
    pub fn mark_multi_threaded(&self, threads: usize, memory: Option<&MemoryProbe>) -> HeapResult<u64> {
        let threads = threads.max(1);
        let n = self.bits.len();
        let range = memory.map(|probe| {
            let free = probe.available_bytes();
            let range = locality_size(n, self.adjacency.footprint_bytes(), free, threads);
            debug!(
                "Locality window of {} ids ({} bytes free, {} objects, {} threads)",
                range, free, n, threads
            );
            range
        });

        self.run_workers(threads, || match (memory, range) {
            (Some(probe), Some(range)) => Window::adaptive(n, range, probe),
            _ => Window::everything(n),
        })
    }

    fn run_workers<'w>(&self, threads: usize, window: impl Fn() -> Window<'w>) -> HeapResult<u64> {
        let mut initial = Vec::new();
        for &root in self.roots {
            if self.bits.mark(root) {
                initial.push(root);
            }
        }
        let mut marked = initial.len() as u64;
        self.monitor.listener.begin_task(TASK_NAME, initial.len() as u64);

        let stack = SharedRootStack::new(initial);
        let results: Vec<HeapResult<u64>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    // every worker links before any can see an empty stack
                    let link = stack.link();
                    let worker = Worker::new(self.adjacency, self.bits, &stack, self.monitor, window());
                    s.spawn(move || worker.run(link))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        for result in results {
            marked += result?;
        }
        self.monitor.cancel.check()?;
        debug_assert!(stack.is_empty(), "workers exited with roots left");
        self.monitor.listener.done();
        Ok(marked)
    }

    /// Explicit-stack DFS. Children are marked when pushed, so nothing is
    /// stacked twice; `follow(referrer, child)` decides which edges count.
    fn depth_first(&self, mut follow: impl FnMut(ObjectId, ObjectId) -> HeapResult<bool>) -> HeapResult<u64> {
        let mut stack: Vec<ObjectId> = Vec::with_capacity(10 * 1024);
        let mut marked = 0u64;
        for &root in self.roots {
            if self.bits.mark(root) {
                stack.push(root);
                marked += 1;
            }
        }

        let mut roots_left = stack.len();
        self.monitor.listener.begin_task(TASK_NAME, roots_left as u64);

        let mut children = Vec::new();
        while let Some(current) = stack.pop() {
            // Roots sit at the bottom, so only popping one drops below the count left
            if stack.len() < roots_left {
                roots_left -= 1;
                self.monitor.listener.worked(1);
                self.monitor.cancel.check()?;
            }

            children.clear();
            self.adjacency
                .for_each_outbound(current, |child| children.push(child));
            for &child in &children {
                if !self.bits.is_marked(child) && follow(current, child)? && self.bits.mark(child) {
                    stack.push(child);
                    marked += 1;
                }
            }
        }

        self.monitor.listener.done();
        Ok(marked)
    }
}

impl<'a, A: Adjacency + NamedReferences> ObjectMarker<'a, A> {
    /// Single-threaded marking that does not follow references held only
    /// through excluded fields of excluded referrers
    pub fn mark_excluding(&self, excluded: &[ExcludedReferences]) -> HeapResult<u64> {
        let filter = ExclusionFilter::new(excluded, self.adjacency);
        self.depth_first(|referrer, child| Ok(!filter.skips(referrer, child)?))
    }
}

/// Mark everything reachable from the GC roots of `index`
pub fn mark_gc_roots(index: &HeapIndex, options: &MarkOptions, monitor: Monitor<'_>) -> HeapResult<ReachabilitySet> {
    let roots = index.gc_root_ids();
    let bits = ReachabilitySet::new(index.object_count());
    let marked = ObjectMarker::new(&roots, &bits, index, monitor)?.mark(options)?;
    info!(
        "Marked {} of {} objects reachable from {} GC roots",
        marked,
        index.object_count(),
        roots.len()
    );
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AdjacencyList;
    use crate::model::NamedReference;
    use crate::progress::{CancellationToken, NullListener, ProgressListener};

    fn monitor(cancel: &CancellationToken) -> Monitor<'_> {
        Monitor::new(&NullListener, cancel)
    }

    /// Pseudo-random graph with a few disconnected islands
    fn scrambled_graph(n: u32) -> AdjacencyList {
        let lists = (0..n)
            .map(|i| {
                if i % 97 == 0 {
                    Vec::new()
                } else {
                    vec![(i * 7 + 1) % n, (i * 13 + 5) % n, i / 2]
                }
            })
            .collect();
        AdjacencyList::from_lists(lists)
    }

    fn mark_with(graph: &AdjacencyList, roots: &[ObjectId], options: &MarkOptions) -> (u64, Vec<bool>) {
        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(graph.object_count());
        let count = ObjectMarker::new(roots, &bits, graph, monitor(&cancel))
            .expect("valid roots")
            .mark(options)
            .expect("marking succeeds");
        (count, bits.to_vec())
    }

    #[test]
    fn test_single_threaded_marks_reachable_only() {
        let graph = AdjacencyList::from_lists(vec![vec![1], vec![2], vec![1], vec![0], vec![]]);
        let (count, bits) = mark_with(&graph, &[0], &MarkOptions::default());
        assert_eq!(count, 3);
        assert_eq!(bits, vec![true, true, true, false, false]);
    }

    #[test]
    fn test_marking_twice_marks_nothing_new() {
        let graph = scrambled_graph(2000);
        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(2000);
        let marker = ObjectMarker::new(&[3, 500], &bits, &graph, monitor(&cancel)).unwrap();
        let first = marker.mark_single_threaded().unwrap();
        let snapshot = bits.to_vec();
        assert!(first > 0);
        assert_eq!(marker.mark_single_threaded().unwrap(), 0);
        assert_eq!(bits.to_vec(), snapshot);
        assert_eq!(bits.count_marked() as u64, first);
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let graph = scrambled_graph(60_000);
        let roots = [1, 2, 97, 40_000];
        let (single, expected) = mark_with(&graph, &roots, &MarkOptions::default());
        for threads in [2, 8] {
            let options = MarkOptions {
                threads,
                ..MarkOptions::default()
            };
            let (count, bits) = mark_with(&graph, &roots, &options);
            assert_eq!(bits, expected, "threads = {}", threads);
            assert_eq!(count, single);
        }
    }

    #[test]
    fn test_small_windows_do_not_change_result() {
        let graph = scrambled_graph(20_000);
        let roots = [5, 19_999];
        let (_, expected) = mark_with(&graph, &roots, &MarkOptions::default());

        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(20_000);
        let probe = MemoryProbe::Fixed(0);
        let marker = ObjectMarker::new(&roots, &bits, &graph, monitor(&cancel)).unwrap();
        marker
            .run_workers(4, || Window::adaptive(20_000, 64, &probe))
            .unwrap();
        assert_eq!(bits.to_vec(), expected);
    }

    #[test]
    fn test_locality_option_runs_with_fixed_budget() {
        let graph = scrambled_graph(5000);
        let (_, expected) = mark_with(&graph, &[10], &MarkOptions::default());
        let options = MarkOptions {
            threads: 3,
            locality: true,
            memory_budget_mb: Some(1),
        };
        assert_eq!(mark_with(&graph, &[10], &options).1, expected);
    }

    #[test]
    fn test_cancelled_marking_reports_cancellation() {
        let graph = scrambled_graph(1000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let bits = ReachabilitySet::new(1000);
        let marker = ObjectMarker::new(&[1], &bits, &graph, monitor(&cancel)).unwrap();
        assert!(marker.mark_single_threaded().unwrap_err().is_cancelled());
        assert!(marker.mark_multi_threaded(2, None).unwrap_err().is_cancelled());
    }

    /// Records how many objects were marked at each progress tick
    struct MarkedAtTick<'a> {
        bits: &'a ReachabilitySet,
        seen: parking_lot::Mutex<Vec<usize>>,
    }

    impl ProgressListener for MarkedAtTick<'_> {
        fn worked(&self, _work: u64) {
            self.seen.lock().push(self.bits.count_marked());
        }
    }

    #[test]
    fn test_progress_ticks_once_per_root() {
        // root 1 leads down a chain; root 0 is drained last
        let graph = AdjacencyList::from_lists(vec![vec![], vec![2], vec![3], vec![]]);
        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(4);
        let listener = MarkedAtTick {
            bits: &bits,
            seen: parking_lot::Mutex::new(Vec::new()),
        };
        let marker = ObjectMarker::new(&[0, 1], &bits, &graph, Monitor::new(&listener, &cancel)).unwrap();
        assert_eq!(marker.mark_single_threaded().unwrap(), 4);
        assert_eq!(*listener.seen.lock(), vec![2, 4]);
    }

    #[test]
    fn test_invalid_roots_are_rejected() {
        let graph = AdjacencyList::new(3);
        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(3);
        assert!(matches!(
            ObjectMarker::new(&[3], &bits, &graph, monitor(&cancel)),
            Err(HeapError::InvalidObjectId { id: 3, count: 3 })
        ));
        let short = ReachabilitySet::new(2);
        assert!(matches!(
            ObjectMarker::new(&[0], &short, &graph, monitor(&cancel)),
            Err(HeapError::BitsetSizeMismatch { bits: 2, objects: 3 })
        ));
    }

    /// Reference-like graph: 0 -> 1 via `referent`, 0 -> 2 via `next`
    struct ReferenceGraph {
        graph: AdjacencyList,
    }

    impl Adjacency for ReferenceGraph {
        fn object_count(&self) -> usize {
            self.graph.object_count()
        }

        fn for_each_outbound<F: FnMut(ObjectId)>(&self, id: ObjectId, f: F) {
            self.graph.for_each_outbound(id, f)
        }

        fn footprint_bytes(&self) -> u64 {
            self.graph.footprint_bytes()
        }
    }

    impl NamedReferences for ReferenceGraph {
        fn address_of(&self, id: ObjectId) -> HeapResult<u64> {
            Ok(0x1000 + id as u64 * 0x10)
        }

        fn named_references(&self, id: ObjectId) -> HeapResult<Vec<NamedReference>> {
            Ok(match id {
                0 => vec![
                    NamedReference::new("referent", 0x1010),
                    NamedReference::new("next", 0x1020),
                ],
                _ => Vec::new(),
            })
        }
    }

    #[test]
    fn test_excluded_field_is_not_followed() {
        let graph = ReferenceGraph {
            graph: AdjacencyList::from_lists(vec![vec![1, 2], vec![3], vec![], vec![]]),
        };
        let cancel = CancellationToken::new();
        let bits = ReachabilitySet::new(4);
        let excluded = [ExcludedReferences::new([0], Some(["referent"]))];
        let marked = ObjectMarker::new(&[0], &bits, &graph, monitor(&cancel))
            .unwrap()
            .mark_excluding(&excluded)
            .unwrap();
        assert_eq!(marked, 2);
        assert_eq!(bits.to_vec(), vec![true, false, true, false]);
    }
}
