//! Depth-first marking thread with an id-locality window
//!
//! Each worker keeps objects whose ids fall into a sliding window on a local
//! stack and everything else on a local queue, so consecutive adjacency reads
//! stay close together in the outbound index. Excess work is offered to the
//! shared root stack when other threads have room for it.

use super::bits::ReachabilitySet;
use super::memory::MemoryProbe;
use super::root_stack::{SharedRootStack, ThreadLink, RESERVED_RUNNING, RESERVED_WAITING};
use crate::index::Adjacency;
use crate::model::ObjectId;
use crate::progress::Monitor;
use crate::HeapResult;
use tracing::trace;

/// Local items kept back before offering work to the shared stack
const RESERVED: usize = RESERVED_WAITING - RESERVED_RUNNING;
/// Largest local stack; further in-window items go to the queue
const MAX_STACK: usize = 100 * 1024;
/// Pops between offers of excess work
const CHECK_INTERVAL: usize = 10_000;
const INITIAL_SCALE_UP: f64 = 0.005;

/// Id range a worker prefers to traverse next
#[derive(Debug)]
pub(crate) struct Window<'a> {
    object_count: usize,
    range: usize,
    limit: usize,
    base: usize,
    scale_up: f64,
    armed: bool,
    memory: Option<&'a MemoryProbe>,
}

impl<'a> Window<'a> {
    /// A window of `range` ids that adapts to memory pressure reported by `memory`
    pub(crate) fn adaptive(object_count: usize, range: usize, memory: &'a MemoryProbe) -> Self {
        let range = range.clamp(1.min(object_count), object_count);
        Self {
            object_count,
            range,
            limit: range,
            base: 0,
            scale_up: INITIAL_SCALE_UP,
            armed: false,
            memory: Some(memory),
        }
    }

    /// A window covering every id
    pub(crate) fn everything(object_count: usize) -> Self {
        Self {
            object_count,
            range: object_count,
            limit: object_count,
            base: 0,
            scale_up: 0.0,
            armed: true,
            memory: None,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        let id = id as usize;
        id >= self.base && id - self.base < self.range
    }

    /// Re-center the window: a quarter of the range below `id`, the rest above
    pub(crate) fn center_on(&mut self, id: ObjectId) {
        self.adjust_range();
        let upper = (id as usize + self.range * 3 / 4).min(self.object_count);
        self.base = upper.saturating_sub(self.range);
    }

    /// Grow slowly while memory is plentiful, shrink towards the initial
    /// size under pressure, halving the growth rate each time.
    fn adjust_range(&mut self) {
        let Some(memory) = self.memory else {
            return;
        };
        if !self.armed {
            self.armed = true;
            return;
        }
        if !memory.under_pressure() {
            if self.range < self.object_count && self.scale_up > 0.0 {
                let grown = (self.range as f64 * (1.0 + self.scale_up)) as usize;
                self.range = grown.min(self.object_count);
            }
        } else if self.range == self.limit && self.scale_up == 0.0 {
            // already at the minimum
        } else {
            self.range = ((self.range as f64 * 0.9) as usize).max(self.limit);
            self.scale_up *= 0.5;
            if self.scale_up * (self.range as f64) < 1.0 {
                self.scale_up = 0.0;
            }
        }
    }

    pub(crate) fn range(&self) -> usize {
        self.range
    }
}

pub(crate) struct Worker<'a, A> {
    adjacency: &'a A,
    bits: &'a ReachabilitySet,
    roots: &'a SharedRootStack,
    monitor: Monitor<'a>,
    window: Window<'a>,
    local: Vec<ObjectId>,
    queue: Vec<ObjectId>,
    children: Vec<ObjectId>,
    check: bool,
    check_count: usize,
    marked: u64,
}

impl<'a, A: Adjacency> Worker<'a, A> {
    pub(crate) fn new(
        adjacency: &'a A,
        bits: &'a ReachabilitySet,
        roots: &'a SharedRootStack,
        monitor: Monitor<'a>,
        window: Window<'a>,
    ) -> Self {
        Self {
            adjacency,
            bits,
            roots,
            monitor,
            window,
            local: Vec::with_capacity(1024),
            queue: Vec::with_capacity(1024),
            children: Vec::new(),
            check: false,
            check_count: 0,
            marked: 0,
        }
    }

    /// Drain the shared stack until every linked worker is idle. `link` must
    /// be taken before any worker starts. Returns the number of objects this
    /// worker marked.
    pub(crate) fn run(mut self, link: ThreadLink<'a>) -> HeapResult<u64> {
        let _link = link;
        loop {
            let (root, ticks) = self.roots.pop_or_wait();
            if ticks > 0 {
                self.monitor.listener.worked(ticks);
            }
            let Some(root) = root else {
                break;
            };
            self.queue.push(root);

            while let Some(next) = self.queue.pop() {
                self.monitor.cancel.check()?;
                self.restart_at(next);
                self.drain_local();
            }
        }
        trace!(
            "Worker marked {} objects, window range {}",
            self.marked,
            self.window.range()
        );
        Ok(self.marked)
    }

    fn restart_at(&mut self, id: ObjectId) {
        self.local.clear();
        self.local.push(id);
        self.window.center_on(id);
        self.fill_local();
    }

    /// Move queued items that fall into the window onto the local stack
    fn fill_local(&mut self) {
        let window = &self.window;
        let local = &mut self.local;
        self.queue.retain(|&id| {
            if local.len() < MAX_STACK && window.contains(id) {
                local.push(id);
                false
            } else {
                true
            }
        });
    }

    fn drain_local(&mut self) {
        while let Some(popped) = self.local.pop() {
            let mut current = popped;
            if self.check || self.check_count >= CHECK_INTERVAL {
                self.check_count = 0;
                current = self.offer_excess(current);
            } else {
                self.check_count += 1;
            }

            let mut children = std::mem::take(&mut self.children);
            children.clear();
            self.adjacency
                .for_each_outbound(current, |child| children.push(child));

            for &child in &children {
                if !self.bits.mark(child) {
                    continue;
                }
                self.marked += 1;
                if self.local.is_empty() {
                    self.restart_at(child);
                } else if self.window.contains(child) && self.local.len() < MAX_STACK {
                    self.local.push(child);
                } else {
                    self.queue.push(child);
                }
            }
            self.children = children;
        }
    }

    /// Hand queued or local work to the shared stack while it has room.
    /// Returns the item to process next, which may differ from `current`
    /// when `current` itself was handed over.
    fn offer_excess(&mut self, mut current: ObjectId) -> ObjectId {
        self.check = true;
        if !self.queue.is_empty() && self.queue.len() + self.local.len() > RESERVED {
            let mut shared = self.roots.lock();
            while let Some(id) = self.queue.pop() {
                self.check = shared.push_if_capacity(id);
                if !self.check {
                    self.queue.push(id);
                    break;
                }
                if self.queue.len() + self.local.len() <= RESERVED {
                    break;
                }
            }
        } else if self.local.len() > RESERVED {
            let mut shared = self.roots.lock();
            loop {
                self.check = shared.push_if_capacity(current);
                if !self.check {
                    break;
                }
                match self.local.pop() {
                    Some(next) => current = next,
                    None => break,
                }
                if self.local.len() <= RESERVED {
                    break;
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AdjacencyList;
    use crate::progress::{CancellationToken, NullListener};

    #[test]
    fn test_window_is_centered_around_id() {
        let probe = MemoryProbe::Fixed(u64::MAX);
        let mut window = Window::adaptive(1000, 100, &probe);
        window.center_on(500);
        assert!(window.contains(475));
        assert!(window.contains(574));
        assert!(!window.contains(474));
        assert!(!window.contains(575));

        // near the end the window is shifted down
        window.center_on(990);
        assert!(window.contains(999));
        assert!(!window.contains(899));
    }

    #[test]
    fn test_window_grows_without_pressure() {
        let probe = MemoryProbe::Fixed(u64::MAX);
        let mut window = Window::adaptive(1_000_000, 10_000, &probe);
        window.center_on(0);
        assert_eq!(window.range(), 10_000);
        window.center_on(0);
        assert!(window.range() > 10_000);
    }

    #[test]
    fn test_single_worker_marks_reachable() {
        let graph = AdjacencyList::from_lists(vec![vec![1, 2], vec![3], vec![], vec![0], vec![2]]);
        let bits = ReachabilitySet::new(5);
        assert!(bits.mark(0));
        let stack = SharedRootStack::new(vec![0]);
        let cancel = CancellationToken::new();
        let monitor = Monitor::new(&NullListener, &cancel);

        let worker = Worker::new(&graph, &bits, &stack, monitor, Window::everything(5));
        assert_eq!(worker.run(stack.link()).unwrap(), 3);
        assert_eq!(bits.to_vec(), vec![true, true, true, true, false]);
    }
}
