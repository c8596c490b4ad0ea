use {
  crate::varint::VarInt,
  bytes::{Buf, BufMut, Bytes},
  thiserror::Error,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
  #[error("unexpected end of input")]
  UnexpectedEof,
  #[error("invalid {0} kind")]
  InvalidKind(&'static str),
  #[error("maximum {0} size exceeded")]
  TooLarge(&'static str),
  #[error("invalid {0}")]
  Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait Encode: Sized {
  /// Encode a value of `Self` into `buf`.
  fn encode<B: BufMut>(&self, buf: &mut B);
}

pub trait Decode: Sized {
  /// Decode a value of `Self` from `buf`.
  fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

macro_rules! impl_for {
  ($ty:ident, $put:ident, $get:ident) => {
    impl Encode for $ty {
      fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.$put(*self)
      }
    }
    impl Decode for $ty {
      fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < std::mem::size_of::<Self>() {
          Err(Error::UnexpectedEof)
        } else {
          Ok(buf.$get())
        }
      }
    }
  };
}

impl_for!(u8, put_u8, get_u8);
impl_for!(u16, put_u16, get_u16);
impl_for!(u32, put_u32, get_u32);
impl_for!(u64, put_u64, get_u64);

/// Write `data` prefixed with its varint length.
pub fn put_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
  VarInt::clamped(data.len() as u64).encode(buf);
  buf.put_slice(data);
}

/// Read a varint-length-prefixed byte string of at most `max` bytes.
pub fn get_bytes<B: Buf>(buf: &mut B, max: usize, what: &'static str) -> Result<Bytes> {
  let len = VarInt::decode(buf)?.into_inner() as usize;
  if len > max {
    return Err(Error::TooLarge(what));
  }
  if buf.remaining() < len {
    return Err(Error::UnexpectedEof);
  }
  Ok(buf.copy_to_bytes(len))
}

/// Encoded size of a length-prefixed byte string.
pub fn bytes_len(len: usize) -> usize {
  VarInt::clamped(len as u64).size() + len
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  #[test]
  fn short_integers_are_eof() {
    assert_eq!(u32::decode(&mut &[0u8, 1, 2][..]), Err(Error::UnexpectedEof));
    assert_eq!(u16::decode(&mut &[0u8, 1][..]), Ok(1));
  }

  #[test]
  fn length_prefixed_bytes() {
    let mut buf = Vec::new();
    put_bytes(&mut buf, b"hello");
    assert_eq!(buf.len(), bytes_len(5));
    assert_eq!(&get_bytes(&mut &buf[..], 16, "test").unwrap()[..], b"hello");
    assert_eq!(get_bytes(&mut &buf[..], 4, "test"), Err(Error::TooLarge("test")));
    assert_eq!(get_bytes(&mut &buf[..3], 16, "test"), Err(Error::UnexpectedEof));
  }
}
