use std::collections::VecDeque;

/// Unbounded FIFO holding items that arrived after the window budget ran out.
#[derive(Debug)]
pub struct OverflowQueue<I> {
    items: VecDeque<I>,
}

impl<I> Default for OverflowQueue<I> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<I> OverflowQueue<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: I) {
        self.items.push_back(item);
    }

    /// Remove up to `n` items from the head, in arrival order
    pub fn dequeue_up_to(&mut self, n: usize) -> Vec<I> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    /// Put items back at the head, keeping their relative order.
    ///
    /// Used when drained items could not all be admitted; they stay ahead of
    /// everything queued after them.
    pub fn requeue_front(&mut self, items: Vec<I>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn drain_all(&mut self) -> Vec<I> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
