use crate::packet::{Range, MAX_ACK_RANGES};

/// Ring buffer indexed by sequence number.
///
/// Each slot remembers which sequence last wrote to it, so stale entries from
/// an earlier lap around the ring are never mistaken for current ones.
pub struct Buffer<T> {
  inner: Vec<Option<(u64, T)>>,
}

impl<T> Buffer<T> {
  pub fn new(size: usize) -> Self {
    let mut inner = Vec::new();
    inner.resize_with(size.max(1), || None);
    Self { inner }
  }

  #[inline]
  fn index(&self, sequence: u64) -> usize {
    (sequence % self.inner.len() as u64) as usize
  }

  pub fn len(&self) -> usize {
    self.inner.len()
  }

  /// Get the entry at `sequence % buffer.size`, if the sequence matches.
  pub fn get(&self, sequence: u64) -> Option<&T> {
    match &self.inner[self.index(sequence)] {
      Some((seq, item)) if *seq == sequence => Some(item),
      _ => None,
    }
  }

  /// Insert an entry at `sequence % buffer.size`, overwriting the existing entry.
  pub fn insert(&mut self, sequence: u64, item: T) {
    let index = self.index(sequence);
    self.inner[index] = Some((sequence, item));
  }
}

/// Window of recently received packet ids.
///
/// Drops duplicates and anything older than the window, and builds the ack
/// ranges sent back to the peer.
pub struct Received {
  ids: Buffer<()>,
  largest: Option<u64>,
}

impl Received {
  pub fn new(window: usize) -> Self {
    Self { ids: Buffer::new(window), largest: None }
  }

  pub fn largest(&self) -> Option<u64> {
    self.largest
  }

  /// Whether `id` was already seen, or is too old to tell.
  pub fn is_duplicate(&self, id: u64) -> bool {
    match self.largest {
      Some(largest) => id.saturating_add(self.ids.len() as u64) <= largest || self.ids.get(id).is_some(),
      None => false,
    }
  }

  /// Returns `false` if `id` was already seen or is too old to tell.
  pub fn insert(&mut self, id: u64) -> bool {
    if self.is_duplicate(id) {
      return false;
    }
    self.ids.insert(id, ());
    self.largest = Some(self.largest.map_or(id, |l| l.max(id)));
    true
  }

  /// Ack ranges covering every id inside the window, highest first.
  pub fn ranges(&self) -> Vec<Range> {
    let Some(largest) = self.largest else {
      return Vec::new();
    };
    let lowest = largest.saturating_sub(self.ids.len() as u64 - 1);
    let mut ranges: Vec<Range> = Vec::new();
    let mut run: Option<Range> = None;
    let mut id = largest;
    loop {
      if self.ids.get(id).is_some() {
        run = Some(match run {
          Some(r) => Range { start: r.start, len: r.len + 1 },
          None => Range { start: id, len: 0 },
        });
      } else if let Some(r) = run.take() {
        ranges.push(r);
        if ranges.len() == MAX_ACK_RANGES {
          return ranges;
        }
      }
      if id == lowest {
        break;
      }
      id -= 1;
    }
    if let Some(r) = run {
      if ranges.len() < MAX_ACK_RANGES {
        ranges.push(r);
      }
    }
    ranges
  }
}
