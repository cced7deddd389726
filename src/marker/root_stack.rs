//! Work stack shared by marker threads

use crate::model::ObjectId;
use parking_lot::{Condvar, Mutex, MutexGuard};

/// Items kept on the shared stack for each waiting thread
pub const RESERVED_WAITING: usize = 20;
/// Items kept on the shared stack for each running thread besides the pusher
pub const RESERVED_RUNNING: usize = 5;

#[derive(Debug)]
struct StackState {
    items: Vec<ObjectId>,
    waiting: usize,
    threads: usize,
    total_work: u64,
    worked: u64,
    pushed: u64,
    last_done: u64,
}

impl StackState {
    /// Ticks to report since the last call. The total is the initial stack
    /// size; items pushed later shrink the remaining ticks proportionally.
    fn worked(&mut self) -> u64 {
        let remaining = self.items.len() as u64;
        let done = self.pushed - remaining;
        let new_done = done.saturating_sub(self.last_done);
        if new_done == 0 {
            return 0;
        }
        let ticks_left = self.total_work - self.worked;
        let mut ticks = ticks_left * new_done / (new_done + remaining);
        if ticks < self.total_work / 1000 {
            ticks = 0;
        }
        if ticks > 0 {
            self.worked += ticks;
            self.last_done = done;
        }
        ticks
    }
}

/// A stack of ids with termination detection: a thread that finds it empty
/// waits until another thread pushes work, or until every thread waits.
#[derive(Debug)]
pub struct SharedRootStack {
    state: Mutex<StackState>,
    available: Condvar,
}

/// Locked access for pushing several items in one critical section
pub struct StackGuard<'a> {
    state: MutexGuard<'a, StackState>,
    available: &'a Condvar,
}

impl StackGuard<'_> {
    /// Push only while the stack holds fewer items than are reserved for the
    /// waiting and the other running threads. `false` means keep it locally.
    pub fn push_if_capacity(&mut self, id: ObjectId) -> bool {
        let state = &mut *self.state;
        let running_others = state.threads.saturating_sub(state.waiting + 1);
        let reserved = state.waiting * RESERVED_WAITING + running_others * RESERVED_RUNNING;
        if reserved <= state.items.len() {
            return false;
        }
        state.items.push(id);
        state.pushed += 1;
        if state.waiting > 0 {
            self.available.notify_all();
        }
        true
    }
}

/// Unlinks a worker from the stack when dropped
pub struct ThreadLink<'a> {
    stack: &'a SharedRootStack,
}

impl Drop for ThreadLink<'_> {
    fn drop(&mut self) {
        let mut state = self.stack.state.lock();
        state.threads -= 1;
        if state.waiting >= state.threads {
            // everyone left is waiting, so all must finish
            self.stack.available.notify_all();
        }
    }
}

impl SharedRootStack {
    pub fn new(roots: Vec<ObjectId>) -> Self {
        let total = roots.len() as u64;
        Self {
            state: Mutex::new(StackState {
                items: roots,
                waiting: 0,
                threads: 0,
                total_work: total,
                worked: 0,
                pushed: total,
                last_done: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a worker for termination detection
    pub fn link(&self) -> ThreadLink<'_> {
        self.state.lock().threads += 1;
        ThreadLink { stack: self }
    }

    pub fn lock(&self) -> StackGuard<'_> {
        StackGuard {
            state: self.state.lock(),
            available: &self.available,
        }
    }

    /// Pop an item, waiting while the stack is empty and some thread still
    /// works. `None` once every linked thread is waiting. Also returns the
    /// progress ticks earned since the last call.
    pub fn pop_or_wait(&self) -> (Option<ObjectId>, u64) {
        let mut state = self.state.lock();
        let item = match state.items.pop() {
            Some(id) => Some(id),
            None => {
                state.waiting += 1;
                while state.waiting < state.threads && state.items.is_empty() {
                    self.available.wait(&mut state);
                }
                if state.waiting >= state.threads {
                    state.waiting -= 1;
                    None
                } else {
                    state.waiting -= 1;
                    state.items.pop()
                }
            }
        };
        let ticks = state.worked();
        (item, ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_thread_drains_then_finishes() {
        let stack = SharedRootStack::new(vec![1, 2]);
        let _link = stack.link();
        assert_eq!(stack.pop_or_wait().0, Some(2));
        assert_eq!(stack.pop_or_wait().0, Some(1));
        assert_eq!(stack.pop_or_wait().0, None);
    }

    #[test]
    fn test_push_needs_another_thread() {
        let stack = SharedRootStack::new(Vec::new());
        let _a = stack.link();
        // alone: nothing is reserved
        assert!(!stack.lock().push_if_capacity(7));

        let _b = stack.link();
        let mut guard = stack.lock();
        for id in 0..RESERVED_RUNNING as ObjectId {
            assert!(guard.push_if_capacity(id));
        }
        assert!(!guard.push_if_capacity(99));
    }

    #[test]
    fn test_waiting_thread_receives_pushed_work() {
        let stack = SharedRootStack::new(Vec::new());
        let stack = &stack;
        std::thread::scope(|s| {
            let _main = stack.link();
            let waiter = {
                let link = stack.link();
                s.spawn(move || {
                    let _link = link;
                    stack.pop_or_wait().0
                })
            };
            // wait until the other thread blocks
            while stack.state.lock().waiting == 0 {
                std::thread::yield_now();
            }
            assert!(stack.lock().push_if_capacity(42));
            assert_eq!(waiter.join().unwrap(), Some(42));
        });
    }

    #[test]
    fn test_progress_ticks_cover_initial_work() {
        let stack = SharedRootStack::new((0..10).collect());
        let _link = stack.link();
        let mut total = 0;
        while let (Some(_), ticks) = stack.pop_or_wait() {
            total += ticks;
        }
        assert_eq!(total, 10);
    }
}
