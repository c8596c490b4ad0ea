use {
  crate::identity::Identity,
  bitflags::bitflags,
  bytes::Bytes,
  std::time::Instant,
};

/// Hard upper bound on a single message, matching the largest send the wire format allows.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

bitflags! {
  /// Delivery options for [`Messages::send`](crate::Messages::send).
  ///
  /// The empty set is [`SendFlags::UNRELIABLE`].
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct SendFlags: u32 {
    /// Send as soon as possible instead of waiting a few milliseconds to coalesce small messages.
    const NO_NAGLE = 1;
    /// Drop an unreliable message if it cannot go out right away
    /// (session still connecting, congestion window full).
    const NO_DELAY = 1 << 2;
    /// Guaranteed, in-order delivery per channel.
    const RELIABLE = 1 << 3;
    /// If the session is broken, start a new one instead of failing the send.
    const AUTO_RESTART_BROKEN_SESSION = 1 << 5;

    const UNRELIABLE_NO_NAGLE = Self::NO_NAGLE.bits();
    const UNRELIABLE_NO_DELAY = Self::NO_DELAY.bits() | Self::NO_NAGLE.bits();
    const RELIABLE_NO_NAGLE = Self::RELIABLE.bits() | Self::NO_NAGLE.bits();
  }
}

impl SendFlags {
  pub const UNRELIABLE: SendFlags = SendFlags::empty();

  #[inline]
  pub fn is_reliable(self) -> bool {
    self.contains(SendFlags::RELIABLE)
  }
}

/// A message received from a peer.
///
/// Dropping the message releases its buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  peer: Identity,
  channel: u32,
  number: u64,
  reliable: bool,
  payload: Bytes,
  received_at: Instant,
}

impl Message {
  pub(crate) fn new(
    peer: Identity,
    channel: u32,
    number: u64,
    reliable: bool,
    payload: Bytes,
    received_at: Instant,
  ) -> Self {
    Self { peer, channel, number, reliable, payload, received_at }
  }

  /// Who sent this message.
  pub fn peer(&self) -> &Identity {
    &self.peer
  }

  pub fn channel(&self) -> u32 {
    self.channel
  }

  /// Per-channel sequence number assigned by the sender.
  ///
  /// Reliable and unreliable messages are numbered independently.
  pub fn number(&self) -> u64 {
    self.number
  }

  pub fn is_reliable(&self) -> bool {
    self.reliable
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn into_payload(self) -> Bytes {
    self.payload
  }

  pub fn len(&self) -> usize {
    self.payload.len()
  }

  pub fn is_empty(&self) -> bool {
    self.payload.is_empty()
  }

  pub fn received_at(&self) -> Instant {
    self.received_at
  }
}

/// One fragment of an outgoing message.
///
/// Chunks hold a cheap `Bytes` slice of the original payload, so requeueing a
/// lost reliable chunk never copies data.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Chunk {
  pub channel: u32,
  pub reliable: bool,
  pub number: u64,
  pub offset: u32,
  pub total: u32,
  pub data: Bytes,
  pub queued_at: Instant,
}

/// Split `payload` into chunks of at most `max_chunk` bytes.
///
/// An empty payload still produces one (empty) chunk, so that it is delivered.
pub(crate) fn split(
  payload: Bytes,
  max_chunk: usize,
  channel: u32,
  reliable: bool,
  number: u64,
  queued_at: Instant,
) -> Vec<Chunk> {
  let total = payload.len() as u32;
  let max_chunk = max_chunk.max(1);
  let count = payload.len().div_ceil(max_chunk).max(1);
  (0..count)
    .map(|i| {
      let start = i * max_chunk;
      let end = usize::min(start + max_chunk, payload.len());
      Chunk {
        channel,
        reliable,
        number,
        offset: start as u32,
        total,
        data: payload.slice(start..end),
        queued_at,
      }
    })
    .collect()
}
