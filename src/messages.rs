use {
  crate::{
    config::{Config, Role},
    driver::{self, Command, Driver, Shared, SOCKET, WAKER},
    endpoint::Endpoint,
    error::{Error, Result},
    handler::Handler,
    identity::Identity,
    info::SessionInfo,
    message::{Message, SendFlags},
  },
  bytes::Bytes,
  crossbeam::channel,
  mio::{net::UdpSocket, Interest, Poll, Waker},
  parking_lot::Mutex,
  std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
    time::Instant,
  },
};

/// Handle to a running messaging instance.
///
/// Handles are cheap to clone and can be used from any thread. Every call is
/// serialized with the driver thread, so no call observes a half-processed
/// datagram.
///
/// The driver stops when [`Messages::shutdown`] is called, or once every handle
/// outside of the handler has been dropped.
#[derive(Clone)]
pub struct Messages {
  shared: Arc<Shared>,
}

impl Messages {
  /// Send `payload` to `peer` on `channel`.
  ///
  /// Starts a session with `peer` if there is none. Sending to a peer which
  /// requested a session accepts it. Fails with
  /// [`Error::Shutdown`](crate::Error::Shutdown) once the driver is gone.
  pub fn send(
    &self,
    peer: &Identity,
    payload: impl Into<Bytes>,
    flags: SendFlags,
    channel: u32,
  ) -> Result<()> {
    if !self.shared.is_running() {
      return Err(Error::Shutdown);
    }
    let result = self
      .shared
      .endpoint
      .lock()
      .send(Instant::now(), peer, payload.into(), flags, channel);
    if result.is_ok() {
      self.shared.wake();
    }
    result
  }

  /// Take up to `max` messages received on `channel`, from any peer.
  ///
  /// Messages from one peer come out in the order they were sent, as far as
  /// their delivery guarantees go.
  pub fn receive(&self, channel: u32, max: usize) -> Vec<Message> {
    self.shared.endpoint.lock().receive(Instant::now(), channel, max)
  }

  /// Accept the session `peer` requested.
  ///
  /// Returns `false` if there is no such session, it has failed, or the
  /// driver is gone.
  pub fn accept_session(&self, peer: &Identity) -> bool {
    if !self.shared.is_running() {
      return false;
    }
    let accepted = self
      .shared
      .endpoint
      .lock()
      .accept_session(Instant::now(), peer);
    if accepted {
      self.shared.wake();
    }
    accepted
  }

  /// Close every channel to `peer` without notifying the application.
  ///
  /// Returns `false` if there was no session.
  pub fn close_session(&self, peer: &Identity) -> bool {
    let closed = self.shared.endpoint.lock().close_session(peer);
    if closed {
      self.shared.wake();
    }
    closed
  }

  /// Close `channel` to `peer`. Closing the last open channel closes the session.
  pub fn close_channel(&self, peer: &Identity, channel: u32) -> bool {
    let closed = self
      .shared
      .endpoint
      .lock()
      .close_channel(Instant::now(), peer, channel);
    if closed {
      self.shared.wake();
    }
    closed
  }

  pub fn session_info(&self, peer: &Identity) -> SessionInfo {
    self.shared.endpoint.lock().session_info(Instant::now(), peer)
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.shared.local_addr
  }

  /// The identity announced to peers.
  pub fn identity(&self) -> &Identity {
    &self.shared.identity
  }

  pub fn role(&self) -> Role {
    self.shared.role
  }

  /// Close all sessions and stop the driver. Blocks until the driver is done.
  ///
  /// Fails with [`Error::Shutdown`](crate::Error::Shutdown) if the driver is
  /// already gone. Must not be called from a [`Handler`] method.
  pub fn shutdown(&self) -> Result<()> {
    driver::shutdown(&self.shared)
  }
}

/// Bind to `addr` with default configuration, and start the driver on a new thread.
pub fn bind<F, H>(addr: SocketAddr, factory: F) -> Result<(Messages, JoinHandle<Result<()>>)>
where
  F: FnOnce(Messages) -> H,
  H: Handler + Send + 'static,
{
  bind_with(Config { bind_addr: addr, ..Config::default() }, factory)
}

/// Bind to `config.bind_addr` with custom configuration, and start the driver on a new thread.
///
/// `factory` receives a handle so that the handler can act on notifications,
/// for example to accept sessions. A configured identity must be valid.
pub fn bind_with<F, H>(config: Config, factory: F) -> Result<(Messages, JoinHandle<Result<()>>)>
where
  F: FnOnce(Messages) -> H,
  H: Handler + Send + 'static,
{
  if let Some(identity) = config.identity.as_ref().filter(|i| !i.is_valid()) {
    return Err(Error::InvalidIdentity(identity.clone()));
  }
  let mut socket = UdpSocket::bind(config.bind_addr)?;
  let local_addr = socket.local_addr()?;
  let poll = Poll::new()?;
  poll
    .registry()
    .register(&mut socket, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
  let waker = Waker::new(poll.registry(), WAKER)?;

  let role = config.role;
  let endpoint = Endpoint::new(config, local_addr);
  let (commands, receiver) = channel::bounded::<Command>(32);
  let shared = Arc::new(Shared {
    identity: endpoint.identity().clone(),
    endpoint: Mutex::new(endpoint),
    waker,
    commands,
    local_addr,
    role,
    running: AtomicBool::new(true),
  });
  let messages = Messages { shared: shared.clone() };
  let handler = factory(messages.clone());
  let driver = Driver::new(shared, socket, poll, receiver, handler);
  let name = match role {
    Role::User => "berth-user",
    Role::GameServer => "berth-gameserver",
  };
  let handle = thread::Builder::new()
    .name(name.into())
    .spawn(move || driver.run())?;
  log::info!("{:?} bound to {}", role, local_addr);
  Ok((messages, handle))
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{info::ConnectionState, info::Event},
    pretty_assertions::assert_eq,
    std::time::Duration,
  };

  fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
  }

  fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
  }

  /// Accepts every session request.
  struct Accept(Messages);

  impl Handler for Accept {
    fn on_session_request(&mut self, peer: &Identity) -> Result<()> {
      self.0.accept_session(peer);
      Ok(())
    }
  }

  fn receive_one(messages: &Messages, channel: u32) -> Message {
    for _ in 0..500 {
      if let Some(message) = messages.receive(channel, 1).pop() {
        return message;
      }
      thread::sleep(Duration::from_millis(10));
    }
    panic!("nothing arrived on channel {}", channel);
  }

  #[test]
  fn messages_over_loopback() {
    init_log();
    let (server, server_thread) = bind(loopback(), Accept).unwrap();
    let (events, event_rx) = channel::unbounded::<Event>();
    let (client, client_thread) = bind_with(
      Config { bind_addr: loopback(), identity: Some(Identity::SteamId(42)), ..Config::default() },
      move |_| events,
    )
    .unwrap();

    let server_id = Identity::Ip(server.local_addr());
    client
      .send(&server_id, &b"ping"[..], SendFlags::RELIABLE, 3)
      .unwrap();
    let ping = receive_one(&server, 3);
    assert_eq!(ping.payload(), b"ping");
    assert_eq!(ping.peer(), &Identity::SteamId(42));

    server
      .send(ping.peer(), &b"pong"[..], SendFlags::RELIABLE_NO_NAGLE, 3)
      .unwrap();
    let pong = receive_one(&client, 3);
    assert_eq!(pong.payload(), b"pong");
    assert_eq!(
      client.session_info(&server_id).state,
      ConnectionState::Connected
    );
    // the client started the session, so it is never asked to accept one
    assert!(event_rx.try_recv().is_err());

    client.shutdown().unwrap();
    client_thread.join().unwrap().unwrap();
    assert!(matches!(client.shutdown(), Err(Error::Shutdown)));

    server.shutdown().unwrap();
    server_thread.join().unwrap().unwrap();
  }

  #[test]
  fn dropping_every_handle_stops_the_driver() {
    init_log();
    let (messages, handle) = bind(loopback(), |_| ()).unwrap();
    assert_eq!(messages.role(), Role::User);
    assert_eq!(messages.identity(), &Identity::Ip(messages.local_addr()));
    drop(messages);
    handle.join().unwrap().unwrap();
  }

  #[test]
  fn calls_after_shutdown_fail() {
    init_log();
    let (messages, handle) = bind(loopback(), |_| ()).unwrap();
    messages.shutdown().unwrap();
    handle.join().unwrap().unwrap();

    let peer = Identity::Ip(SocketAddr::from(([127, 0, 0, 1], 9)));
    assert!(matches!(
      messages.send(&peer, &b"late"[..], SendFlags::RELIABLE, 0),
      Err(Error::Shutdown)
    ));
    assert!(!messages.accept_session(&peer));
    assert_eq!(messages.session_info(&peer).state, ConnectionState::None);
  }

  #[test]
  fn invalid_configured_identity_is_rejected() {
    init_log();
    for identity in [
      Identity::generic_string("x".repeat(300)),
      Identity::generic_bytes(Vec::new()),
      Identity::SteamId(0),
    ] {
      let config = Config { bind_addr: loopback(), identity: Some(identity.clone()), ..Config::default() };
      match bind_with(config, |_| ()) {
        Err(Error::InvalidIdentity(rejected)) => assert_eq!(rejected, identity),
        other => panic!("expected an invalid identity error, got {:?}", other.map(|_| ())),
      }
    }
  }
}
