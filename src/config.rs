use {
  crate::{identity::Identity, message::MAX_MESSAGE_SIZE, Protocol},
  indexmap::IndexMap,
  std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
  },
};

/// Which of the two independent instances this is.
///
/// A process may run one of each, for example a listen server that is also a
/// client. They never share sessions or sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
  #[default]
  User,
  GameServer,
}

#[derive(Debug, Clone)]
pub struct Config {
  /// Packets with a different protocol tag are dropped.
  pub protocol: Protocol,
  /// Announced to peers during the handshake.
  ///
  /// Defaults to the bound socket address.
  pub identity: Option<Identity>,
  pub bind_addr: SocketAddr,
  pub role: Role,
  /// Addresses of peers which can't be reached through their identity alone.
  ///
  /// Routes learned from handshakes take precedence.
  pub routes: IndexMap<Identity, SocketAddr>,
  /// Maximum datagram size
  pub mtu: usize,
  pub max_sessions: usize,
  /// Received messages held per channel until `receive` picks them up.
  pub inbox_capacity: usize,
  pub max_message_size: usize,
  /// Unsent bytes queued per session before `send` fails.
  pub send_buffer_size: usize,
  /// Bytes of partially received messages held per session.
  pub recv_buffer_size: usize,
  /// How long a handshake may take.
  pub connect_timeout: Duration,
  /// How long a session with data in flight may go without hearing from the peer.
  pub connection_timeout: Duration,
  /// Sessions without traffic are reclaimed after this long.
  pub idle_timeout: Duration,
  pub handshake_interval: Duration,
  /// Minimum time between repeated session requests from the same peer.
  pub session_request_interval: Duration,
  /// How long small messages wait to be coalesced with others.
  pub nagle_delay: Duration,
  /// How long the receiver may hold back an acknowledgement.
  pub max_ack_delay: Duration,
  /// Upper bound on how long the driver sleeps between checks.
  pub max_poll_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      protocol: Protocol::from("berth"),
      identity: None,
      bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
      role: Role::User,
      routes: IndexMap::new(),
      mtu: 1200,
      max_sessions: 256,
      inbox_capacity: 1024,
      max_message_size: MAX_MESSAGE_SIZE,
      send_buffer_size: 1024 * 1024,
      recv_buffer_size: 1024 * 1024,
      connect_timeout: Duration::from_secs(10),
      connection_timeout: Duration::from_secs(10),
      idle_timeout: Duration::from_secs(180),
      handshake_interval: Duration::from_millis(250),
      session_request_interval: Duration::from_secs(1),
      nagle_delay: Duration::from_millis(5),
      max_ack_delay: Duration::from_millis(25),
      max_poll_interval: Duration::from_millis(100),
    }
  }
}

impl Config {
  pub fn with_role(role: Role) -> Self {
    Self { role, ..Self::default() }
  }

  /// Largest payload accepted by `send`.
  pub(crate) fn message_size_limit(&self) -> usize {
    usize::min(self.max_message_size, MAX_MESSAGE_SIZE)
  }
}
