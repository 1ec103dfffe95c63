//! Two-phase queue for engine callbacks that arrive before torrent metadata.
//!
//! Phase one buffers closures. Phase two starts with a single
//! [`DeferredQueue::drain_and_dispose`]; afterwards every [`DeferredQueue::push`]
//! hands the task back so the caller runs it directly.

use parking_lot::Mutex;

use super::TorrentError;

/// Buffered task queue that can be disposed exactly once.
pub struct DeferredQueue<T> {
    tasks: Mutex<Option<Vec<T>>>,
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Some(Vec::new())),
        }
    }

    /// Buffers a task.
    ///
    /// # Errors
    ///
    /// Returns the task unchanged if the queue has already been disposed.
    pub fn push(&self, task: T) -> Result<(), T> {
        match self.tasks.lock().as_mut() {
            Some(tasks) => {
                tasks.push(task);
                Ok(())
            }
            None => Err(task),
        }
    }

    /// Takes every buffered task in arrival order and closes the queue.
    ///
    /// # Errors
    ///
    /// - `TorrentError::QueueAlreadyDisposed` - If called a second time
    pub fn drain_and_dispose(&self) -> Result<Vec<T>, TorrentError> {
        self.tasks
            .lock()
            .take()
            .ok_or(TorrentError::QueueAlreadyDisposed)
    }

    pub fn is_disposed(&self) -> bool {
        self.tasks.lock().is_none()
    }

    /// Number of buffered tasks; zero once disposed.
    pub fn len(&self) -> usize {
        self.tasks.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let queue = DeferredQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.drain_and_dispose().unwrap(), vec![1, 2, 3]);
        assert!(queue.is_disposed());
    }

    #[test]
    fn test_push_after_dispose_returns_task() {
        let queue = DeferredQueue::new();
        queue.drain_and_dispose().unwrap();

        assert_eq!(queue.push(7), Err(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_dispose_is_an_error() {
        let queue: DeferredQueue<u32> = DeferredQueue::new();
        queue.drain_and_dispose().unwrap();

        assert!(matches!(
            queue.drain_and_dispose(),
            Err(TorrentError::QueueAlreadyDisposed)
        ));
    }

    #[test]
    fn test_concurrent_push_and_dispose_loses_nothing() {
        let queue = Arc::new(DeferredQueue::new());
        let pushers: Vec<_> = (0..4)
            .map(|worker| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut rejected = Vec::new();
                    for i in 0..1000 {
                        if let Err(task) = queue.push(worker * 1000 + i) {
                            rejected.push(task);
                        }
                    }
                    rejected
                })
            })
            .collect();

        let drained = queue.drain_and_dispose().unwrap();
        let rejected: usize = pushers.into_iter().map(|p| p.join().unwrap().len()).sum();

        assert_eq!(drained.len() + rejected, 4000);
    }
}
