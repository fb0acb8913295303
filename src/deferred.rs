// Deferred work queue
//
// Work issued before the GPU device exists is parked here and replayed,
// in order, once the device reports ready.

use std::collections::VecDeque;

use parking_lot::Mutex;

struct Queue<T> {
    pending: VecDeque<T>,
    processing: bool,
}

/// FIFO of work waiting on device readiness
///
/// `process` drains exactly the tasks present when it starts. Tasks
/// enqueued while a drain runs (including by the tasks themselves) stay
/// queued for the next call, and a `process` call made from inside a
/// running task returns immediately.
pub struct DeferredInitManager<T> {
    queue: Mutex<Queue<T>>,
}

impl<T> Default for DeferredInitManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredInitManager<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                processing: false,
            }),
        }
    }

    /// Append a task; never blocks on device work
    pub fn enqueue(&self, task: T) {
        self.queue.lock().pending.push_back(task);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.lock().pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Drop every pending task without running it
    pub fn clear(&self) {
        self.queue.lock().pending.clear();
    }

    /// Run every task queued at entry if `is_ready()` holds.
    ///
    /// Returns the number of tasks run. The queue lock is not held while
    /// tasks execute.
    pub fn process(&self, is_ready: impl FnOnce() -> bool, mut run: impl FnMut(T)) -> usize {
        let batch = {
            let mut queue = self.queue.lock();
            if queue.processing {
                return 0;
            }
            if queue.pending.is_empty() || !is_ready() {
                return 0;
            }
            queue.processing = true;
            std::mem::take(&mut queue.pending)
        };

        let _guard = ProcessingGuard { queue: &self.queue };
        let count = batch.len();
        for task in batch {
            run(task);
        }
        if count > 0 {
            log::debug!("Processed {} deferred task(s)", count);
        }
        count
    }
}

/// Clears the processing flag even if a task panics
struct ProcessingGuard<'a, T> {
    queue: &'a Mutex<Queue<T>>,
}

impl<T> Drop for ProcessingGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.lock().processing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Arc;

    #[test]
    fn test_not_ready_keeps_tasks() {
        let queue = DeferredInitManager::new();
        queue.enqueue(1);
        queue.enqueue(2);

        assert_eq!(queue.process(|| false, |_| panic!("must not run")), 0);
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn test_drains_in_fifo_order() {
        let queue = DeferredInitManager::new();
        for i in 0..5 {
            queue.enqueue(i);
        }

        let mut seen = Vec::new();
        assert_eq!(queue.process(|| true, |t| seen.push(t)), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_tasks_enqueued_during_drain_wait_for_next_call() {
        let queue = Arc::new(DeferredInitManager::<u32>::new());
        queue.enqueue(1);
        queue.enqueue(2);

        let ran = RefCell::new(Vec::new());
        let inner = Arc::clone(&queue);
        queue.process(
            || true,
            |t| {
                ran.borrow_mut().push(t);
                inner.enqueue(t + 10);
            },
        );
        assert_eq!(*ran.borrow(), vec![1, 2]);
        assert_eq!(queue.pending_len(), 2);

        queue.process(|| true, |t| ran.borrow_mut().push(t));
        assert_eq!(*ran.borrow(), vec![1, 2, 11, 12]);
    }

    #[test]
    fn test_reentrant_process_is_a_no_op() {
        let queue = Arc::new(DeferredInitManager::<u32>::new());
        queue.enqueue(1);
        queue.enqueue(2);

        let inner = Arc::clone(&queue);
        let mut nested = Vec::new();
        let mut ran = Vec::new();
        queue.process(
            || true,
            |t| {
                ran.push(t);
                nested.push(inner.process(|| true, |_| panic!("nested drain ran a task")));
            },
        );

        assert_eq!(ran, vec![1, 2]);
        assert_eq!(nested, vec![0, 0]);
    }

    #[test]
    fn test_empty_queue_skips_readiness_check() {
        let queue = DeferredInitManager::<u32>::new();
        assert_eq!(queue.process(|| panic!("checked readiness"), |_| {}), 0);
    }
}
