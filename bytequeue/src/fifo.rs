//! Unbounded blocking FIFO used to hand sealed chunks to the reader.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{QueueError, Result};
use crate::stage::Interrupt;

/// A thread-safe growable FIFO.
///
/// `push` never blocks, so the writer is never held up by a slow reader.
/// `pop` blocks while the FIFO is empty.
pub(crate) struct Fifo<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Fifo<T> {
    pub(crate) fn new() -> Self {
        Fifo {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Appends an item and wakes a blocked `pop`.
    pub(crate) fn push(&self, item: T) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Puts an item back at the head, ahead of everything queued.
    pub(crate) fn push_front(&self, item: T) {
        let mut items = self.items.lock();
        items.push_front(item);
        self.not_empty.notify_one();
    }

    /// Removes the head item, blocking while the FIFO is empty.
    ///
    /// Returns `Interrupted` if `interrupt` is raised while waiting.
    pub(crate) fn pop(&self, interrupt: &Interrupt) -> Result<T> {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Ok(item);
            }
            if interrupt.take() {
                return Err(QueueError::Interrupted);
            }
            self.not_empty.wait(&mut items);
        }
    }

    /// Removes the head item without blocking.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Takes every queued item, leaving the FIFO empty.
    pub(crate) fn take_all(&mut self) -> Vec<T> {
        self.items.get_mut().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Wakes a blocked `pop` so it re-checks the interrupt flag.
    pub(crate) fn wake(&self) {
        let _items = self.items.lock();
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let fifo = Fifo::new();
        let interrupt = Interrupt::default();
        fifo.push(1);
        fifo.push(2);
        fifo.push_front(0);

        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.pop(&interrupt).unwrap(), 0);
        assert_eq!(fifo.pop(&interrupt).unwrap(), 1);
        assert_eq!(fifo.try_pop(), Some(2));
        assert_eq!(fifo.try_pop(), None);
    }

    #[test]
    fn test_blocking_pop() {
        let fifo = Arc::new(Fifo::new());
        let reader_fifo = Arc::clone(&fifo);

        let reader = thread::spawn(move || reader_fifo.pop(&Interrupt::default()).unwrap());

        // Give the reader time to block
        thread::sleep(Duration::from_millis(10));
        fifo.push(42);

        assert_eq!(reader.join().unwrap(), 42);
    }

    #[test]
    fn test_interrupted_pop() {
        let fifo = Arc::new(Fifo::<u32>::new());
        let interrupt = Arc::new(Interrupt::default());
        let reader_fifo = Arc::clone(&fifo);
        let reader_interrupt = Arc::clone(&interrupt);

        let reader = thread::spawn(move || reader_fifo.pop(&reader_interrupt));

        thread::sleep(Duration::from_millis(10));
        interrupt.raise();
        fifo.wake();

        assert!(matches!(
            reader.join().unwrap(),
            Err(QueueError::Interrupted)
        ));
    }

    #[test]
    fn test_take_all() {
        let mut fifo = Fifo::new();
        fifo.push("a");
        fifo.push("b");
        assert_eq!(fifo.take_all(), vec!["a", "b"]);
        assert_eq!(fifo.len(), 0);
    }
}
