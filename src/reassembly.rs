use {
  crate::packet::Segment,
  bytes::{Bytes, BytesMut},
  indexmap::IndexMap,
  std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound::{Excluded, Unbounded},
  },
};

/// Unreliable messages still waiting for segments, per channel.
const MAX_UNRELIABLE_PARTIALS: usize = 32;

/// A message being put back together from its segments.
struct Partial {
  total: u32,
  data: BytesMut,
  /// offset -> length of every segment received so far
  pieces: BTreeMap<u32, u32>,
  filled: usize,
}

impl Partial {
  fn new(total: u32) -> Self {
    Self {
      total,
      data: BytesMut::zeroed(total as usize),
      pieces: BTreeMap::new(),
      filled: 0,
    }
  }

  /// Returns the number of new bytes stored, or `None` if the segment
  /// overlaps a different segment received earlier.
  fn put(&mut self, segment: &Segment) -> Option<usize> {
    let start = segment.offset;
    let len = segment.data.len() as u32;
    let end = start + len;
    if let Some(&existing) = self.pieces.get(&start) {
      return (existing == len).then_some(0);
    }
    let before = self.pieces.range(..start).next_back();
    if before.is_some_and(|(&offset, &len)| offset + len > start) {
      return None;
    }
    let after = self.pieces.range((Excluded(start), Unbounded)).next();
    if after.is_some_and(|(&offset, _)| offset < end) {
      return None;
    }
    self.data[start as usize..end as usize].copy_from_slice(&segment.data);
    self.pieces.insert(start, len);
    self.filled += len as usize;
    Some(len as usize)
  }

  fn is_complete(&self) -> bool {
    !self.pieces.is_empty() && self.filled >= self.total as usize
  }

  fn into_payload(self) -> Bytes {
    self.data.freeze()
  }
}

/// Outcome of handing a segment to [`Inbound::on_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
  /// Stored, or a harmless duplicate.
  Stored,
  /// Not stored because the receive buffer is full. The packet must not be acked.
  Full,
  /// The segment contradicts earlier segments of the same message.
  Deviant,
}

/// Receive side of one channel.
#[derive(Default)]
pub struct Inbound {
  next_reliable: u64,
  reliable: BTreeMap<u64, Partial>,
  unreliable: IndexMap<u64, Partial>,
  ready_unreliable: VecDeque<(u64, Bytes)>,
  buffered: usize,
}

impl Inbound {
  /// Bytes currently held in partial or undelivered messages.
  pub fn buffered(&self) -> usize {
    self.buffered
  }

  /// `budget` is how many more bytes this session may buffer.
  pub fn on_segment(&mut self, segment: &Segment, budget: usize) -> Accept {
    if segment.reliable {
      if segment.number < self.next_reliable {
        return Accept::Stored;
      }
      let partial = match self.reliable.get_mut(&segment.number) {
        Some(partial) => partial,
        None => {
          if segment.total as usize > budget {
            return Accept::Full;
          }
          self.buffered += segment.total as usize;
          self.reliable.entry(segment.number).or_insert_with(|| Partial::new(segment.total))
        }
      };
      if partial.total != segment.total || partial.put(segment).is_none() {
        return Accept::Deviant;
      }
      Accept::Stored
    } else {
      if let Some(partial) = self.unreliable.get_mut(&segment.number) {
        if partial.total != segment.total || partial.put(segment).is_none() {
          return Accept::Deviant;
        }
      } else {
        // unreliable data is never worth a retransmission, so a full buffer just drops it
        if segment.total as usize > budget {
          return Accept::Stored;
        }
        if self.unreliable.len() == MAX_UNRELIABLE_PARTIALS {
          if let Some((_, evicted)) = self.unreliable.shift_remove_index(0) {
            self.buffered -= evicted.total as usize;
          }
        }
        self.buffered += segment.total as usize;
        let mut partial = Partial::new(segment.total);
        partial.put(segment);
        self.unreliable.insert(segment.number, partial);
      }
      if self.unreliable.get(&segment.number).is_some_and(Partial::is_complete) {
        if let Some(partial) = self.unreliable.shift_remove(&segment.number) {
          self.ready_unreliable.push_back((segment.number, partial.into_payload()));
        }
      }
      Accept::Stored
    }
  }

  /// Take the next deliverable message, if any.
  ///
  /// Reliable messages come out strictly in send order.
  pub fn pop_ready(&mut self) -> Option<(u64, bool, Bytes)> {
    let next = self.next_reliable;
    if self.reliable.get(&next).is_some_and(Partial::is_complete) {
      if let Some(partial) = self.reliable.remove(&next) {
        self.next_reliable += 1;
        self.buffered -= partial.total as usize;
        return Some((next, true, partial.into_payload()));
      }
    }
    let (number, payload) = self.ready_unreliable.pop_front()?;
    self.buffered -= payload.len();
    Some((number, false, payload))
  }

  /// Drop completed unreliable messages nobody has room for.
  pub fn drop_ready_unreliable(&mut self) -> usize {
    let count = self.ready_unreliable.len();
    for (_, payload) in self.ready_unreliable.drain(..) {
      self.buffered -= payload.len();
    }
    count
  }

  /// Give up on reliable messages numbered below `next`.
  ///
  /// The sender closed the channel and will never send them. Returns the
  /// number of bytes released.
  pub fn skip_to(&mut self, next: u64) -> usize {
    if next <= self.next_reliable {
      return 0;
    }
    let kept = self.reliable.split_off(&next);
    let dropped = std::mem::replace(&mut self.reliable, kept);
    let released = dropped.values().map(|p| p.total as usize).sum();
    self.buffered -= released;
    self.next_reliable = next;
    released
  }

  /// Drop everything buffered, but keep the ordering state so that later
  /// messages on this channel are still accepted in order.
  ///
  /// Returns the number of bytes released.
  pub fn clear(&mut self) -> usize {
    // skip reliable messages that were already (partially) received, they are gone now
    if let Some((&last, _)) = self.reliable.last_key_value() {
      self.next_reliable = last + 1;
    }
    self.reliable.clear();
    self.unreliable.clear();
    self.ready_unreliable.clear();
    std::mem::take(&mut self.buffered)
  }
}
