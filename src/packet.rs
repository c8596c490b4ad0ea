use {
  crate::{
    codec::{self, Decode, Encode},
    identity::Identity,
    message::{Chunk, MAX_MESSAGE_SIZE},
    varint::{size_of_value, VarInt},
  },
  bytes::{Buf, BufMut, Bytes},
};

/// Fixed part of the header: protocol + dst + src.
const FIXED_HEADER_LEN: usize = 8 + 4 + 4;
/// Upper bound on header bytes, used when sizing chunks.
pub const MAX_HEADER_LEN: usize = FIXED_HEADER_LEN + 8;
/// Upper bound on the per-segment framing overhead.
pub const MAX_SEGMENT_OVERHEAD: usize = 1 + 8 + 1 + 8 + 4 + 4 + 4;
/// Most ack ranges a single ack frame may carry.
pub const MAX_ACK_RANGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
  pub protocol: u64,
  /// Session id of the receiver, or 0 for a `Hello`.
  pub dst: u32,
  /// Session id of the sender, or 0 if it has none.
  pub src: u32,
  pub packet_id: u64,
}

impl Header {
  pub fn encoded_len(&self) -> usize {
    FIXED_HEADER_LEN + size_of_value(self.packet_id)
  }
}

impl Encode for Header {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    self.protocol.encode(buf);
    self.dst.encode(buf);
    self.src.encode(buf);
    VarInt::clamped(self.packet_id).encode(buf);
  }
}

impl Decode for Header {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let protocol = u64::decode(buf)?;
    let dst = u32::decode(buf)?;
    let src = u32::decode(buf)?;
    let packet_id = VarInt::decode(buf)?.into_inner();
    Ok(Self { protocol, dst, src, packet_id })
  }
}

/// Represents an ack range.
///
/// Used to efficiently encode large amounts of packet acknowledgement statuses, under
/// the assumption that unacknowledged packets will be far rarer than acknowledged ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
  /// Highest acked packet id
  pub start: u64,
  /// Number of packets before `start` to ack
  pub len: u64,
}

impl Range {
  /// Lowest packet id covered by this range.
  pub fn low(&self) -> u64 {
    self.start.saturating_sub(self.len)
  }

  fn encoded_len(&self) -> usize {
    size_of_value(self.start) + size_of_value(self.len)
  }
}

impl Encode for Range {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    VarInt::clamped(self.start).encode(buf);
    VarInt::clamped(self.len).encode(buf);
  }
}

impl Decode for Range {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let start = VarInt::decode(buf)?.into_inner();
    let len = VarInt::decode(buf)?.into_inner();
    if len > start {
      return Err(codec::Error::Invalid("ack range"));
    }
    Ok(Self { start, len })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
  /// How long the receiver held the largest acked packet before acking it, in microseconds.
  pub delay: u64,
  /// Highest range first.
  pub ranges: Vec<Range>,
}

impl Ack {
  fn encoded_len(&self) -> usize {
    size_of_value(self.delay)
      + size_of_value(self.ranges.len() as u64)
      + self.ranges.iter().map(Range::encoded_len).sum::<usize>()
  }
}

impl Encode for Ack {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    VarInt::clamped(self.delay).encode(buf);
    VarInt::clamped(self.ranges.len() as u64).encode(buf);
    for range in &self.ranges {
      range.encode(buf);
    }
  }
}

impl Decode for Ack {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let delay = VarInt::decode(buf)?.into_inner();
    let len = VarInt::decode(buf)?.into_inner() as usize;
    if len > MAX_ACK_RANGES {
      return Err(codec::Error::TooLarge("ack range list"));
    }
    let mut ranges = Vec::with_capacity(len);
    for _ in 0..len {
      ranges.push(Range::decode(buf)?);
    }
    Ok(Self { delay, ranges })
  }
}

/// A piece of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
  pub channel: u32,
  pub reliable: bool,
  /// Per-channel message number
  pub number: u64,
  /// Offset of `data` within the message
  pub offset: u32,
  /// Length of the whole message
  pub total: u32,
  pub data: Bytes,
}

const SEGMENT_RELIABLE: u8 = 0b0000_0001;

impl Segment {
  fn encoded_len(&self) -> usize {
    size_of_value(self.channel as u64)
      + 1
      + size_of_value(self.number)
      + size_of_value(self.offset as u64)
      + size_of_value(self.total as u64)
      + codec::bytes_len(self.data.len())
  }
}

impl From<&Chunk> for Segment {
  fn from(chunk: &Chunk) -> Self {
    Self {
      channel: chunk.channel,
      reliable: chunk.reliable,
      number: chunk.number,
      offset: chunk.offset,
      total: chunk.total,
      data: chunk.data.clone(),
    }
  }
}

impl Encode for Segment {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    VarInt::from(self.channel).encode(buf);
    let flags = if self.reliable { SEGMENT_RELIABLE } else { 0 };
    flags.encode(buf);
    VarInt::clamped(self.number).encode(buf);
    VarInt::from(self.offset).encode(buf);
    VarInt::from(self.total).encode(buf);
    codec::put_bytes(buf, &self.data);
  }
}

fn decode_u32<B: Buf>(buf: &mut B, what: &'static str) -> codec::Result<u32> {
  u32::try_from(VarInt::decode(buf)?.into_inner()).map_err(|_| codec::Error::TooLarge(what))
}

impl Decode for Segment {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let channel = decode_u32(buf, "channel")?;
    let flags = u8::decode(buf)?;
    if flags & !SEGMENT_RELIABLE != 0 {
      return Err(codec::Error::Invalid("segment flags"));
    }
    let number = VarInt::decode(buf)?.into_inner();
    let offset = decode_u32(buf, "segment offset")?;
    let total = decode_u32(buf, "message")?;
    if total as usize > MAX_MESSAGE_SIZE {
      return Err(codec::Error::TooLarge("message"));
    }
    let data = codec::get_bytes(buf, MAX_MESSAGE_SIZE, "segment")?;
    if offset as usize + data.len() > total as usize {
      return Err(codec::Error::Invalid("segment bounds"));
    }
    Ok(Self {
      channel,
      reliable: flags & SEGMENT_RELIABLE != 0,
      number,
      offset,
      total,
      data,
    })
  }
}

/// The sender gave up on every reliable message below `next` on `channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skip {
  pub channel: u32,
  pub next: u64,
}

impl Skip {
  fn encoded_len(&self) -> usize {
    size_of_value(self.channel as u64) + size_of_value(self.next)
  }
}

impl Encode for Skip {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    VarInt::from(self.channel).encode(buf);
    VarInt::clamped(self.next).encode(buf);
  }
}

impl Decode for Skip {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let channel = decode_u32(buf, "channel")?;
    let next = VarInt::decode(buf)?.into_inner();
    Ok(Self { channel, next })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
  /// The sender closed the session on purpose.
  Normal,
  /// The sender has no session with the id the receiver used.
  UnknownSession,
}

impl Encode for CloseReason {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    let v: u8 = match self {
      CloseReason::Normal => 0,
      CloseReason::UnknownSession => 1,
    };
    v.encode(buf);
  }
}

impl Decode for CloseReason {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    match u8::decode(buf)? {
      0 => Ok(CloseReason::Normal),
      1 => Ok(CloseReason::UnknownSession),
      _ => Err(codec::Error::InvalidKind("close reason")),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
  /// Handshake request, carrying the initiator's identity.
  Hello(Identity),
  /// Handshake reply, carrying the acceptor's identity.
  Welcome(Identity),
  Ack(Ack),
  Segment(Segment),
  Close(CloseReason),
  Skip(Skip),
}

mod tag {
  pub const HELLO: u8 = 0x01;
  pub const WELCOME: u8 = 0x02;
  pub const ACK: u8 = 0x03;
  pub const SEGMENT: u8 = 0x04;
  pub const CLOSE: u8 = 0x05;
  pub const SKIP: u8 = 0x06;
}

impl Frame {
  pub fn encoded_len(&self) -> usize {
    1 + match self {
      Frame::Hello(identity) | Frame::Welcome(identity) => identity.encoded_len(),
      Frame::Ack(ack) => ack.encoded_len(),
      Frame::Segment(segment) => segment.encoded_len(),
      Frame::Close(_) => 1,
      Frame::Skip(skip) => skip.encoded_len(),
    }
  }

  /// Whether receiving this frame obliges the receiver to send an ack.
  pub fn is_ack_eliciting(&self) -> bool {
    matches!(self, Frame::Segment(_) | Frame::Skip(_))
  }
}

impl Encode for Frame {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    match self {
      Frame::Hello(identity) => {
        tag::HELLO.encode(buf);
        identity.encode(buf);
      }
      Frame::Welcome(identity) => {
        tag::WELCOME.encode(buf);
        identity.encode(buf);
      }
      Frame::Ack(ack) => {
        tag::ACK.encode(buf);
        ack.encode(buf);
      }
      Frame::Segment(segment) => {
        tag::SEGMENT.encode(buf);
        segment.encode(buf);
      }
      Frame::Close(reason) => {
        tag::CLOSE.encode(buf);
        reason.encode(buf);
      }
      Frame::Skip(skip) => {
        tag::SKIP.encode(buf);
        skip.encode(buf);
      }
    }
  }
}

impl Decode for Frame {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let frame = match u8::decode(buf)? {
      tag::HELLO => Frame::Hello(Identity::decode(buf)?),
      tag::WELCOME => Frame::Welcome(Identity::decode(buf)?),
      tag::ACK => Frame::Ack(Ack::decode(buf)?),
      tag::SEGMENT => Frame::Segment(Segment::decode(buf)?),
      tag::CLOSE => Frame::Close(CloseReason::decode(buf)?),
      tag::SKIP => Frame::Skip(Skip::decode(buf)?),
      _ => return Err(codec::Error::InvalidKind("frame")),
    };
    Ok(frame)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
  pub header: Header,
  pub frames: Vec<Frame>,
}

impl Packet {
  pub fn new(header: Header) -> Self {
    Self { header, frames: Vec::new() }
  }

  pub fn encoded_len(&self) -> usize {
    self.header.encoded_len() + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
  }

  pub fn is_ack_eliciting(&self) -> bool {
    self.frames.iter().any(Frame::is_ack_eliciting)
  }

  pub fn to_bytes(&self) -> Bytes {
    let mut buf = Vec::with_capacity(self.encoded_len());
    self.encode(&mut buf);
    Bytes::from(buf)
  }
}

impl Encode for Packet {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    self.header.encode(buf);
    for frame in &self.frames {
      frame.encode(buf);
    }
  }
}

impl Decode for Packet {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let header = Header::decode(buf)?;
    let mut frames = Vec::new();
    while buf.has_remaining() {
      frames.push(Frame::decode(buf)?);
    }
    Ok(Self { header, frames })
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  fn encode<T: Encode>(value: &T) -> Bytes {
    let mut buf = bytes::BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
  }

  #[test]
  fn encode_and_decode_range() {
    let range = Range { start: 10, len: 3 };
    let mut buf = encode(&range);
    assert_eq!(buf.len(), 2);
    assert_eq!(range.low(), 7);
    assert_eq!(Range::decode(&mut buf).unwrap(), range);
  }

  #[test]
  fn range_longer_than_its_start_is_invalid() {
    let mut buf = encode(&Range { start: 1, len: 5 });
    assert_eq!(Range::decode(&mut buf), Err(codec::Error::Invalid("ack range")));
  }

  #[test]
  fn encode_and_decode_acks() {
    let ack = Ack {
      delay: 100,
      ranges: vec![Range { start: 9, len: 2 }, Range { start: 4, len: 0 }],
    };
    let frame = Frame::Ack(ack.clone());
    let mut buf = encode(&frame);
    assert_eq!(buf.len(), frame.encoded_len());
    assert_eq!(Frame::decode(&mut buf).unwrap(), frame);
  }

  #[test]
  fn too_many_ack_ranges() {
    let mut buf = bytes::BytesMut::new();
    VarInt::from(0u8).encode(&mut buf);
    VarInt::from(65u8).encode(&mut buf);
    assert_eq!(
      Ack::decode(&mut buf.freeze()),
      Err(codec::Error::TooLarge("ack range list"))
    );
  }

  #[test]
  fn encode_and_decode_segment() {
    let segment = Segment {
      channel: 1,
      reliable: true,
      number: 1,
      offset: 256,
      total: 512,
      data: Bytes::from(vec![0u8; 256]),
    };

    let mut buf = encode(&segment);
    assert_eq!(
      buf.len(),
      /* channel, flags, number */ 3 + /* offset, total */ 4 + /* len */ 2 + /* data */ 256
    );
    assert_eq!(buf.len(), segment.encoded_len());
    assert_eq!(Segment::decode(&mut buf).unwrap(), segment);
  }

  #[test]
  fn segment_past_end_of_message() {
    let segment = Segment {
      channel: 0,
      reliable: false,
      number: 0,
      offset: 10,
      total: 12,
      data: Bytes::from_static(b"abc"),
    };
    let mut buf = encode(&segment);
    assert_eq!(Segment::decode(&mut buf), Err(codec::Error::Invalid("segment bounds")));
  }

  #[test]
  fn segment_overhead_bound_holds() {
    let segment = Segment {
      channel: u32::MAX,
      reliable: true,
      number: u32::MAX as u64 * 4,
      offset: MAX_MESSAGE_SIZE as u32,
      total: MAX_MESSAGE_SIZE as u32,
      data: Bytes::from(vec![0u8; 1200]),
    };
    let frame = Frame::Segment(segment);
    assert!(frame.encoded_len() <= MAX_SEGMENT_OVERHEAD + 1200);
  }

  #[test]
  fn skip_frames_are_acked() {
    let frame = Frame::Skip(Skip { channel: 3, next: 300 });
    let mut buf = encode(&frame);
    assert_eq!(buf.len(), /* tag, channel */ 2 + /* next */ 2);
    assert_eq!(buf.len(), frame.encoded_len());
    assert!(frame.is_ack_eliciting());
    assert_eq!(Frame::decode(&mut buf).unwrap(), frame);
  }

  #[rustfmt::skip]
  #[allow(clippy::identity_op)]
  #[test]
  fn encode_and_decode_packet() {
    let mut packet = Packet::new(Header { protocol: 7, dst: 0, src: 1, packet_id: 0 });
    packet.frames.push(Frame::Hello(Identity::SteamId(5)));
    packet.frames.push(Frame::Close(CloseReason::Normal));

    let mut buf = packet.to_bytes();
    assert_eq!(
      buf.len(),
      {
          8 // protocol
        + 4 // dst
        + 4 // src
        + 1 // packet_id
        + 1 // frames[0] tag
        + 1 // frames[0] identity kind
        + 8 // frames[0] steam id
        + 1 // frames[1] tag
        + 1 // frames[1] reason
      }
    );
    assert_eq!(buf.len(), packet.encoded_len());
    assert!(!packet.is_ack_eliciting());
    assert_eq!(Packet::decode(&mut buf).unwrap(), packet);
  }

  #[test]
  fn unknown_frame_kind() {
    let mut buf = encode(&Header { protocol: 0, dst: 1, src: 2, packet_id: 3 }).to_vec();
    buf.push(0x7f);
    assert_eq!(
      Packet::decode(&mut &buf[..]),
      Err(codec::Error::InvalidKind("frame"))
    );
  }
}
