/// Bounded FIFO queue backed by a ring buffer
#[derive(Debug, Clone)]
pub struct Queue<T> {
  buffer: Vec<Option<T>>,
  /// Index of the oldest item
  tail: usize,
  len: usize,
}

impl<T> Queue<T> {
  pub fn new(capacity: usize) -> Self {
    let mut buffer = Vec::new();
    buffer.resize_with(capacity.max(1), || None);
    Self { buffer, tail: 0, len: 0 }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_full(&self) -> bool {
    self.len == self.buffer.len()
  }

  /// Returns `Some(T)` if the queue is full
  pub fn put(&mut self, item: T) -> Option<T> {
    if self.is_full() {
      return Some(item);
    }
    let head = (self.tail + self.len) % self.buffer.len();
    self.buffer[head] = Some(item);
    self.len += 1;
    None
  }

  pub fn get(&mut self) -> Option<T> {
    if self.len == 0 {
      return None;
    }
    let item = self.buffer[self.tail].take();
    self.tail = (self.tail + 1) % self.buffer.len();
    self.len -= 1;
    item
  }

  /// Keep only the items matching `predicate`, preserving their order.
  ///
  /// Returns the number of removed items.
  pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> usize {
    let before = self.len;
    let mut kept = 0;
    for n in 0..before {
      let from = (self.tail + n) % self.buffer.len();
      let item = self.buffer[from].take();
      if let Some(item) = item {
        if predicate(&item) {
          let to = (self.tail + kept) % self.buffer.len();
          self.buffer[to] = Some(item);
          kept += 1;
        }
      }
    }
    self.len = kept;
    before - kept
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  fn drain<T>(queue: &mut Queue<T>) -> Vec<T> {
    std::iter::from_fn(|| queue.get()).collect()
  }

  #[test]
  fn put_and_get() {
    let mut queue = Queue::new(4);

    for i in 0..4 {
      queue.put(i);
    }
    assert_eq!(queue.len(), 4);
    // don't accept more than `capacity`
    assert_eq!(queue.put(4), Some(4));
    assert_eq!(queue.len(), 4);
    let items = drain(&mut queue);
    assert_eq!(queue.len(), 0);
    assert_eq!(&items[..], &[0, 1, 2, 3]);
  }

  #[test]
  fn queue_wraps() {
    let mut queue = Queue::new(4);

    for i in 0..4 {
      queue.put(i);
    }
    assert_eq!(queue.get(), Some(0));
    assert_eq!(queue.put(4), None);
    assert_eq!(queue.put(5), Some(5));
    // the newest item landed in the slot freed at the front of the buffer
    assert_eq!(&queue.buffer[..], &[Some(4), Some(1), Some(2), Some(3)]);
    let items = drain(&mut queue);
    assert_eq!(&items[..], &[1, 2, 3, 4]);
  }

  #[test]
  fn retain_across_the_wrap() {
    let mut queue = Queue::new(4);
    for i in 0..4 {
      queue.put(i);
    }
    queue.get();
    queue.get();
    queue.put(4);
    queue.put(5);
    assert_eq!(&queue.buffer[..], &[Some(4), Some(5), Some(2), Some(3)]);

    assert_eq!(queue.retain(|v| v % 2 == 1), 2);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.put(6), None);
    let items = drain(&mut queue);
    assert_eq!(&items[..], &[3, 5, 6]);
  }

  #[test]
  fn retain_everything_and_nothing() {
    let mut queue = Queue::new(3);
    for i in 0..3 {
      queue.put(i);
    }
    assert_eq!(queue.retain(|_| true), 0);
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.retain(|_| false), 3);
    assert!(queue.is_empty());
    assert_eq!(queue.get(), None);
  }
}
