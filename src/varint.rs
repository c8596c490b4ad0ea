use {
  crate::codec::{self, Decode, Encode},
  bytes::{Buf, BufMut},
};

/// A QUIC-style variable length integer.
///
/// The two most significant bits of the first byte select the encoded width
/// (1, 2, 4 or 8 bytes), which leaves 62 bits for the value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
  pub const MAX: VarInt = VarInt((1 << 62) - 1);

  /// Fails if `value` does not fit into 62 bits.
  pub const fn new(value: u64) -> Option<Self> {
    if value > Self::MAX.0 {
      None
    } else {
      Some(Self(value))
    }
  }

  /// Counters and lengths never get near 2^62, so saturating is fine for them.
  pub const fn clamped(value: u64) -> Self {
    if value > Self::MAX.0 {
      Self::MAX
    } else {
      Self(value)
    }
  }

  pub const fn into_inner(self) -> u64 {
    self.0
  }

  /// Number of bytes `self` occupies on the wire.
  pub const fn size(self) -> usize {
    size_of_value(self.0)
  }
}

/// Encoded width of `value`, assuming it fits.
pub const fn size_of_value(value: u64) -> usize {
  if value < 1 << 6 {
    1
  } else if value < 1 << 14 {
    2
  } else if value < 1 << 30 {
    4
  } else {
    8
  }
}

impl From<u8> for VarInt {
  fn from(v: u8) -> Self {
    Self(v as u64)
  }
}

impl From<u16> for VarInt {
  fn from(v: u16) -> Self {
    Self(v as u64)
  }
}

impl From<u32> for VarInt {
  fn from(v: u32) -> Self {
    Self(v as u64)
  }
}

impl TryFrom<u64> for VarInt {
  type Error = codec::Error;

  fn try_from(v: u64) -> Result<Self, Self::Error> {
    Self::new(v).ok_or(codec::Error::TooLarge("varint"))
  }
}

impl Encode for VarInt {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    let v = self.0;
    match self.size() {
      1 => buf.put_u8(v as u8),
      2 => buf.put_u16(0b01 << 14 | v as u16),
      4 => buf.put_u32(0b10 << 30 | v as u32),
      _ => buf.put_u64(0b11 << 62 | v),
    }
  }
}

impl Decode for VarInt {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    if !buf.has_remaining() {
      return Err(codec::Error::UnexpectedEof);
    }
    let width = 1usize << (buf.chunk()[0] >> 6);
    if buf.remaining() < width {
      return Err(codec::Error::UnexpectedEof);
    }
    let value = match width {
      1 => buf.get_u8() as u64,
      2 => (buf.get_u16() & 0x3fff) as u64,
      4 => (buf.get_u32() & 0x3fff_ffff) as u64,
      _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
    };
    Ok(Self(value))
  }
}
