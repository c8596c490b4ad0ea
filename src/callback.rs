//! Fixed layouts of the two notifications, for handing them across a native
//! callback boundary.
//!
//! Every structure is `#[repr(C, packed)]` and has the exact size of its
//! native counterpart. [`RawEvent::to_bytes`] produces the little-endian byte
//! image without touching the in-memory representation.

use {
  crate::{
    error::Result,
    handler::Handler,
    identity::Identity,
    info::{ConnectionInfo, Event},
  },
  bytes::BufMut,
  static_assertions::assert_eq_size,
  std::net::{IpAddr, SocketAddr},
};

pub const CALLBACK_BASE: i32 = 1250;
pub const SESSION_REQUEST_ID: i32 = CALLBACK_BASE + 1;
pub const SESSION_FAILED_ID: i32 = CALLBACK_BASE + 2;

const MAX_IDENTITY_DATA: usize = 128;
const MAX_STRING: usize = 128;

/// Identity kind tags.
pub mod kind {
  pub const INVALID: i32 = 0;
  pub const IP: i32 = 1;
  pub const GENERIC_STRING: i32 = 2;
  pub const GENERIC_BYTES: i32 = 3;
  pub const STEAM_ID: i32 = 16;
}

/// IPv6 address in network byte order (IPv4 is mapped), and port in host byte order.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddr {
  pub ipv6: [u8; 16],
  pub port: u16,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawIdentity {
  pub kind: i32,
  /// Number of meaningful bytes in `data`.
  pub size: i32,
  pub data: [u8; MAX_IDENTITY_DATA],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawConnectionInfo {
  pub identity: RawIdentity,
  pub addr: RawAddr,
  pub state: i32,
  pub end_reason: i32,
  /// NUL terminated.
  pub end_debug: [u8; MAX_STRING],
  /// NUL terminated.
  pub description: [u8; MAX_STRING],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSessionRequest {
  pub identity: RawIdentity,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSessionFailed {
  pub info: RawConnectionInfo,
}

assert_eq_size!(RawAddr, [u8; 18]);
assert_eq_size!(RawIdentity, [u8; 136]);
assert_eq_size!(RawConnectionInfo, [u8; 418]);
assert_eq_size!(RawSessionRequest, [u8; 136]);
assert_eq_size!(RawSessionFailed, [u8; 418]);

impl From<SocketAddr> for RawAddr {
  fn from(addr: SocketAddr) -> Self {
    let ip = match addr.ip() {
      IpAddr::V4(ip) => ip.to_ipv6_mapped(),
      IpAddr::V6(ip) => ip,
    };
    Self { ipv6: ip.octets(), port: addr.port() }
  }
}

impl RawAddr {
  fn put(&self, buf: &mut impl BufMut) {
    let (ipv6, port) = (self.ipv6, self.port);
    buf.put_slice(&ipv6);
    buf.put_u16_le(port);
  }
}

impl From<&Identity> for RawIdentity {
  fn from(identity: &Identity) -> Self {
    let mut data = [0u8; MAX_IDENTITY_DATA];
    let (tag, size) = match identity {
      Identity::Invalid => (kind::INVALID, 0),
      Identity::Ip(addr) => {
        let mut buf = &mut data[..];
        RawAddr::from(*addr).put(&mut buf);
        (kind::IP, std::mem::size_of::<RawAddr>())
      }
      Identity::SteamId(id) => {
        data[..8].copy_from_slice(&id.to_le_bytes());
        (kind::STEAM_ID, 8)
      }
      Identity::GenericString(s) => {
        // room for the terminator
        let len = s.len().min(MAX_IDENTITY_DATA - 1);
        data[..len].copy_from_slice(&s.as_bytes()[..len]);
        (kind::GENERIC_STRING, len + 1)
      }
      Identity::GenericBytes(b) => {
        let len = b.len().min(MAX_IDENTITY_DATA);
        data[..len].copy_from_slice(&b[..len]);
        (kind::GENERIC_BYTES, len)
      }
    };
    Self { kind: tag, size: size as i32, data }
  }
}

impl RawIdentity {
  fn put(&self, buf: &mut impl BufMut) {
    let (kind, size, data) = (self.kind, self.size, self.data);
    buf.put_i32_le(kind);
    buf.put_i32_le(size);
    buf.put_slice(&data);
  }
}

fn c_string(s: &str) -> [u8; MAX_STRING] {
  let mut out = [0u8; MAX_STRING];
  let len = s.len().min(MAX_STRING - 1);
  out[..len].copy_from_slice(&s.as_bytes()[..len]);
  out
}

impl From<&ConnectionInfo> for RawConnectionInfo {
  fn from(info: &ConnectionInfo) -> Self {
    Self {
      identity: RawIdentity::from(&info.peer),
      addr: RawAddr::from(info.addr),
      state: info.state.code(),
      end_reason: info.end_reason.map_or(0, |r| r.code()),
      end_debug: c_string(&info.end_debug),
      description: c_string(&info.description),
    }
  }
}

impl RawConnectionInfo {
  fn put(&self, buf: &mut impl BufMut) {
    let (identity, addr) = (self.identity, self.addr);
    let (state, end_reason) = (self.state, self.end_reason);
    let (end_debug, description) = (self.end_debug, self.description);
    identity.put(buf);
    addr.put(buf);
    buf.put_i32_le(state);
    buf.put_i32_le(end_reason);
    buf.put_slice(&end_debug);
    buf.put_slice(&description);
  }
}

/// A notification in its native layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
  SessionRequest(RawSessionRequest),
  SessionFailed(RawSessionFailed),
}

impl From<&Event> for RawEvent {
  fn from(event: &Event) -> Self {
    match event {
      Event::SessionRequest { peer } => {
        RawEvent::SessionRequest(RawSessionRequest { identity: RawIdentity::from(peer) })
      }
      Event::SessionFailed { info } => {
        RawEvent::SessionFailed(RawSessionFailed { info: RawConnectionInfo::from(info) })
      }
    }
  }
}

impl RawEvent {
  pub fn id(&self) -> i32 {
    match self {
      RawEvent::SessionRequest(_) => SESSION_REQUEST_ID,
      RawEvent::SessionFailed(_) => SESSION_FAILED_ID,
    }
  }

  /// Byte image of the structure, as laid out in memory on a little-endian target.
  pub fn to_bytes(&self) -> Vec<u8> {
    match self {
      RawEvent::SessionRequest(raw) => {
        let mut buf = Vec::with_capacity(std::mem::size_of::<RawSessionRequest>());
        let identity = raw.identity;
        identity.put(&mut buf);
        buf
      }
      RawEvent::SessionFailed(raw) => {
        let mut buf = Vec::with_capacity(std::mem::size_of::<RawSessionFailed>());
        let info = raw.info;
        info.put(&mut buf);
        buf
      }
    }
  }
}

/// Hands every notification to `F` as a callback id and the byte image of its
/// native structure.
pub struct RawCallback<F>(pub F);

impl<F: FnMut(i32, &[u8])> RawCallback<F> {
  fn post(&mut self, event: &Event) {
    let raw = RawEvent::from(event);
    (self.0)(raw.id(), &raw.to_bytes());
  }
}

impl<F: FnMut(i32, &[u8])> Handler for RawCallback<F> {
  fn on_session_request(&mut self, peer: &Identity) -> Result<()> {
    self.post(&Event::SessionRequest { peer: peer.clone() });
    Ok(())
  }

  fn on_session_failed(&mut self, info: &ConnectionInfo) -> Result<()> {
    self.post(&Event::SessionFailed { info: info.clone() });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      error::EndReason,
      handler::dispatch,
      info::ConnectionState,
    },
    pretty_assertions::assert_eq,
    std::mem::offset_of,
  };

  #[test]
  fn field_offsets() {
    assert_eq!(offset_of!(RawIdentity, size), 4);
    assert_eq!(offset_of!(RawIdentity, data), 8);
    assert_eq!(offset_of!(RawAddr, port), 16);
    assert_eq!(offset_of!(RawConnectionInfo, addr), 136);
    assert_eq!(offset_of!(RawConnectionInfo, state), 154);
    assert_eq!(offset_of!(RawConnectionInfo, end_reason), 158);
    assert_eq!(offset_of!(RawConnectionInfo, end_debug), 162);
    assert_eq!(offset_of!(RawConnectionInfo, description), 290);
  }

  #[test]
  fn identities() {
    let raw = RawIdentity::from(&Identity::SteamId(0x0110_0001_0000_0007));
    let (tag, size, data) = (raw.kind, raw.size, raw.data);
    assert_eq!((tag, size), (kind::STEAM_ID, 8));
    assert_eq!(&data[..8], &0x0110_0001_0000_0007u64.to_le_bytes());

    let raw = RawIdentity::from(&Identity::generic_string("lobby"));
    let (tag, size, data) = (raw.kind, raw.size, raw.data);
    assert_eq!((tag, size), (kind::GENERIC_STRING, 6));
    assert_eq!(&data[..6], b"lobby\0");

    let raw = RawIdentity::from(&Identity::ip(([10, 0, 0, 1], 27015)));
    let (tag, size, data) = (raw.kind, raw.size, raw.data);
    assert_eq!((tag, size), (kind::IP, 18));
    assert_eq!(&data[..16], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1]);
    assert_eq!(&data[16..18], &27015u16.to_le_bytes());

    let raw = RawIdentity::from(&Identity::Invalid);
    let (tag, size) = (raw.kind, raw.size);
    assert_eq!((tag, size), (kind::INVALID, 0));
  }

  #[test]
  fn session_failed_image() {
    let info = ConnectionInfo {
      peer: Identity::SteamId(9),
      addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
      state: ConnectionState::ProblemDetectedLocally,
      end_reason: Some(EndReason::Timeout),
      end_debug: "x".repeat(300),
      description: "session #1 with steamid:9".into(),
    };
    let raw = RawEvent::from(&Event::SessionFailed { info });
    assert_eq!(raw.id(), 1252);
    let bytes = raw.to_bytes();
    assert_eq!(bytes.len(), 418);
    assert_eq!(&bytes[0..4], &kind::STEAM_ID.to_le_bytes());
    assert_eq!(&bytes[154..158], &5i32.to_le_bytes());
    assert_eq!(&bytes[158..162], &5003i32.to_le_bytes());
    // truncated, and still terminated
    assert_eq!(bytes[162 + 126], b'x');
    assert_eq!(bytes[162 + 127], 0);
    assert_eq!(&bytes[290..315], b"session #1 with steamid:9");
  }

  #[test]
  fn raw_callback_posts_images() {
    let mut posted = Vec::new();
    let mut handler = RawCallback(|id: i32, bytes: &[u8]| posted.push((id, bytes.len())));
    let event = Event::SessionRequest { peer: Identity::SteamId(1) };
    dispatch(&mut handler, &event).unwrap();
    drop(handler);
    assert_eq!(posted, vec![(1251, 136)]);
  }
}
