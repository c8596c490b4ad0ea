//! Peer identities.
//!
//! An [`Identity`] names the remote end of a session. It is compared by value and
//! used as the key for every per-peer table in the engine.

use {
  crate::codec::{self, Decode, Encode},
  bytes::{Buf, BufMut},
  std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
  },
  thiserror::Error,
};

/// Longest accepted `GenericString` identity, in bytes.
pub const MAX_GENERIC_STRING_LEN: usize = 31;
/// Longest accepted `GenericBytes` identity.
pub const MAX_GENERIC_BYTES_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Identity {
  #[default]
  Invalid,
  Ip(SocketAddr),
  SteamId(u64),
  GenericString(String),
  GenericBytes(Vec<u8>),
}

impl Identity {
  pub fn ip(addr: impl Into<SocketAddr>) -> Self {
    Identity::Ip(addr.into())
  }

  pub fn generic_string(value: impl Into<String>) -> Self {
    Identity::GenericString(value.into())
  }

  pub fn generic_bytes(value: impl Into<Vec<u8>>) -> Self {
    Identity::GenericBytes(value.into())
  }

  /// Whether this identity can be used to address a peer.
  pub fn is_valid(&self) -> bool {
    match self {
      Identity::Invalid => false,
      Identity::Ip(addr) => !addr.ip().is_unspecified() && addr.port() != 0,
      Identity::SteamId(id) => *id != 0,
      Identity::GenericString(s) => {
        !s.is_empty() && s.len() <= MAX_GENERIC_STRING_LEN && !s.contains('\0')
      }
      Identity::GenericBytes(b) => !b.is_empty() && b.len() <= MAX_GENERIC_BYTES_LEN,
    }
  }

  /// The address an `Ip` identity routes to.
  pub fn ip_addr(&self) -> Option<SocketAddr> {
    match self {
      Identity::Ip(addr) => Some(*addr),
      _ => None,
    }
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Identity::Invalid => write!(f, "invalid"),
      Identity::Ip(addr) => write!(f, "ip:{addr}"),
      Identity::SteamId(id) => write!(f, "steamid:{id}"),
      Identity::GenericString(s) => write!(f, "str:{s}"),
      Identity::GenericBytes(b) => write!(f, "gen:{}", hex::encode(b)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
  #[error("missing identity prefix in {0:?}")]
  MissingPrefix(String),
  #[error("unknown identity prefix {0:?}")]
  UnknownPrefix(String),
  #[error("malformed {kind} identity {value:?}")]
  Malformed { kind: &'static str, value: String },
}

impl FromStr for Identity {
  type Err = ParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s == "invalid" {
      return Ok(Identity::Invalid);
    }
    let (prefix, value) = s
      .split_once(':')
      .ok_or_else(|| ParseError::MissingPrefix(s.to_owned()))?;
    let malformed = |kind| ParseError::Malformed { kind, value: value.to_owned() };
    let identity = match prefix {
      "ip" => Identity::Ip(value.parse().map_err(|_| malformed("ip"))?),
      "steamid" => Identity::SteamId(value.parse().map_err(|_| malformed("steamid"))?),
      "str" => Identity::GenericString(value.to_owned()),
      "gen" => Identity::GenericBytes(hex::decode(value).map_err(|_| malformed("gen"))?),
      other => return Err(ParseError::UnknownPrefix(other.to_owned())),
    };
    if identity.is_valid() {
      Ok(identity)
    } else {
      Err(malformed(prefix_kind(&identity)))
    }
  }
}

fn prefix_kind(identity: &Identity) -> &'static str {
  match identity {
    Identity::Invalid => "invalid",
    Identity::Ip(_) => "ip",
    Identity::SteamId(_) => "steamid",
    Identity::GenericString(_) => "str",
    Identity::GenericBytes(_) => "gen",
  }
}

mod kind {
  pub const INVALID: u8 = 0;
  pub const IPV4: u8 = 1;
  pub const IPV6: u8 = 2;
  pub const STEAM_ID: u8 = 3;
  pub const GENERIC_STRING: u8 = 4;
  pub const GENERIC_BYTES: u8 = 5;
}

impl Identity {
  pub(crate) fn encoded_len(&self) -> usize {
    1 + match self {
      Identity::Invalid => 0,
      Identity::Ip(SocketAddr::V4(_)) => 4 + 2,
      Identity::Ip(SocketAddr::V6(_)) => 16 + 2,
      Identity::SteamId(_) => 8,
      Identity::GenericString(s) => 1 + s.len(),
      Identity::GenericBytes(b) => 1 + b.len(),
    }
  }
}

impl Encode for Identity {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    match self {
      Identity::Invalid => buf.put_u8(kind::INVALID),
      Identity::Ip(SocketAddr::V4(addr)) => {
        buf.put_u8(kind::IPV4);
        buf.put_slice(&addr.ip().octets());
        buf.put_u16(addr.port());
      }
      Identity::Ip(SocketAddr::V6(addr)) => {
        buf.put_u8(kind::IPV6);
        buf.put_slice(&addr.ip().octets());
        buf.put_u16(addr.port());
      }
      Identity::SteamId(id) => {
        buf.put_u8(kind::STEAM_ID);
        buf.put_u64(*id);
      }
      // lengths are bounded by validation, which happens before anything is encoded
      Identity::GenericString(s) => {
        buf.put_u8(kind::GENERIC_STRING);
        buf.put_u8(s.len() as u8);
        buf.put_slice(s.as_bytes());
      }
      Identity::GenericBytes(b) => {
        buf.put_u8(kind::GENERIC_BYTES);
        buf.put_u8(b.len() as u8);
        buf.put_slice(b);
      }
    }
  }
}

fn take<B: Buf, const N: usize>(buf: &mut B) -> codec::Result<[u8; N]> {
  if buf.remaining() < N {
    return Err(codec::Error::UnexpectedEof);
  }
  let mut out = [0u8; N];
  buf.copy_to_slice(&mut out);
  Ok(out)
}

fn take_short<B: Buf>(buf: &mut B, max: usize, what: &'static str) -> codec::Result<Vec<u8>> {
  let len = u8::decode(buf)? as usize;
  if len > max {
    return Err(codec::Error::TooLarge(what));
  }
  if buf.remaining() < len {
    return Err(codec::Error::UnexpectedEof);
  }
  let mut out = vec![0u8; len];
  buf.copy_to_slice(&mut out);
  Ok(out)
}

impl Decode for Identity {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let identity = match u8::decode(buf)? {
      kind::INVALID => Identity::Invalid,
      kind::IPV4 => {
        let ip = Ipv4Addr::from(take::<_, 4>(buf)?);
        Identity::Ip(SocketAddr::new(IpAddr::V4(ip), u16::decode(buf)?))
      }
      kind::IPV6 => {
        let ip = Ipv6Addr::from(take::<_, 16>(buf)?);
        Identity::Ip(SocketAddr::new(IpAddr::V6(ip), u16::decode(buf)?))
      }
      kind::STEAM_ID => Identity::SteamId(u64::decode(buf)?),
      kind::GENERIC_STRING => {
        let raw = take_short(buf, MAX_GENERIC_STRING_LEN, "identity string")?;
        Identity::GenericString(
          String::from_utf8(raw).map_err(|_| codec::Error::Invalid("identity string"))?,
        )
      }
      kind::GENERIC_BYTES => {
        Identity::GenericBytes(take_short(buf, MAX_GENERIC_BYTES_LEN, "identity bytes")?)
      }
      _ => return Err(codec::Error::InvalidKind("identity")),
    };
    Ok(identity)
  }
}
