//! The background event loop.
//!
//! The driver owns the UDP socket and runs the engine: it feeds received
//! datagrams in, fires timers, writes queued datagrams out, and hands
//! notifications to the [`Handler`]. Facade calls share the engine through a
//! lock and wake the loop whenever they change something.

use {
  crate::{
    config::Role,
    endpoint::Endpoint,
    error::{Error, Result},
    handler::{dispatch, Handler},
    identity::Identity,
    info::Event,
    socket::Socket,
  },
  bytes::Bytes,
  crossbeam::channel::{self, Receiver, Sender, TryRecvError},
  mio::{net::UdpSocket, Events, Poll, Token, Waker},
  parking_lot::Mutex,
  std::{
    io,
    net::SocketAddr,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
    time::{Duration, Instant},
  },
};

pub(crate) const SOCKET: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);

pub(crate) enum Command {
  Shutdown { signal: Sender<()> },
}

/// State shared between the facade handles and the driver thread.
pub(crate) struct Shared {
  pub endpoint: Mutex<Endpoint>,
  pub waker: Waker,
  pub commands: Sender<Command>,
  pub local_addr: SocketAddr,
  pub identity: Identity,
  pub role: Role,
  /// Cleared once the driver loop has exited.
  pub running: AtomicBool,
}

impl Shared {
  /// Make the driver look at the engine again.
  pub fn wake(&self) {
    if let Err(e) = self.waker.wake() {
      log::error!("failed to wake the driver: {}", e);
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  fn stopped(&self) {
    self.running.store(false, Ordering::Release);
  }
}

pub enum Signal {
  Stop,
  Continue,
}

/// Try to receive datagrams until the socket returns `WouldBlock`.
pub(crate) fn recv_some<S: Socket>(
  socket: &S,
  endpoint: &mut Endpoint,
  buffer: &mut [u8],
  now: Instant,
) -> io::Result<()> {
  loop {
    match socket.recv_from(buffer) {
      Ok((size, addr)) => {
        endpoint.handle_datagram(now, addr, Bytes::copy_from_slice(&buffer[..size]));
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      // a previous datagram bounced, which the timers will notice on their own
      Err(e)
        if matches!(
          e.kind(),
          io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
        ) =>
      {
        log::trace!("recv: {}", e);
        continue;
      }
      Err(e) => return Err(e),
    }
  }
}

/// Try to send queued datagrams until the socket returns `WouldBlock`.
///
/// A datagram the socket would not take is put back, and `Stop` is returned.
pub(crate) fn send_some<S: Socket>(socket: &S, endpoint: &mut Endpoint, now: Instant) -> Signal {
  while let Some(transmit) = endpoint.poll_transmit(now) {
    match socket.send_to(&transmit.payload, transmit.dst) {
      Ok(_) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        endpoint.requeue(transmit);
        return Signal::Stop;
      }
      Err(e) => {
        // errors are per destination, so the datagram is lost like any other
        log::debug!("send to {} failed: {}", transmit.dst, e);
      }
    }
  }
  Signal::Continue
}

pub(crate) struct Driver<H: Handler> {
  shared: Arc<Shared>,
  socket: UdpSocket,
  poll: Poll,
  events: Events,
  commands: Receiver<Command>,
  handler: H,
  /// enough to hold the maximum size of a UDP datagram
  buffer: Vec<u8>,
  max_poll_interval: Duration,
  /// Set while the socket refuses writes.
  blocked: bool,
  running: bool,
}

impl<H: Handler> Driver<H> {
  pub fn new(
    shared: Arc<Shared>,
    socket: UdpSocket,
    poll: Poll,
    commands: Receiver<Command>,
    handler: H,
  ) -> Self {
    let max_poll_interval = shared.endpoint.lock().config().max_poll_interval;
    Self {
      shared,
      socket,
      poll,
      events: Events::with_capacity(1024),
      commands,
      handler,
      buffer: vec![0u8; 1 << 16],
      max_poll_interval,
      blocked: false,
      running: true,
    }
  }

  pub fn run(mut self) -> Result<()> {
    log::debug!("{:?} driver listening on {}", self.shared.role, self.shared.local_addr);
    match self.run_loop() {
      Ok(()) => Ok(()),
      Err(e) => {
        self.shared.stopped();
        self.handler.on_error(&e);
        Err(e)
      }
    }
  }

  fn run_loop(&mut self) -> Result<()> {
    let mut signal = None;
    while self.running {
      let timeout = self.poll_timeout();
      if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
        if e.kind() == io::ErrorKind::Interrupted {
          continue;
        }
        return Err(e.into());
      }
      for event in self.events.iter() {
        match event.token() {
          SOCKET if event.is_writable() => self.blocked = false,
          _ => {}
        }
      }

      let events = self.step()?;
      for event in &events {
        dispatch(&mut self.handler, event)?;
      }

      signal = self.commands();
      // every handle is gone, nobody can ask us to stop anymore
      if Arc::strong_count(&self.shared) == 1 {
        self.running = false;
      }
    }

    self.shared.stopped();
    self.close_all();
    if let Some(signal) = signal {
      if signal.send(()).is_err() {
        log::debug!("shutdown requester is gone");
      }
    }
    Ok(())
  }

  fn poll_timeout(&self) -> Duration {
    let now = Instant::now();
    let endpoint = self.shared.endpoint.lock();
    let mut timeout = self.max_poll_interval;
    if let Some(deadline) = endpoint.next_timeout() {
      timeout = timeout.min(deadline.saturating_duration_since(now));
    }
    if self.blocked {
      // deadlines that only need the socket can't be met yet
      timeout = timeout.max(Duration::from_millis(1));
    }
    timeout
  }

  /// Run the engine once, and collect its notifications.
  fn step(&mut self) -> Result<Vec<Event>> {
    let now = Instant::now();
    let mut endpoint = self.shared.endpoint.lock();
    recv_some(&self.socket, &mut endpoint, &mut self.buffer, now)?;
    endpoint.handle_timeout(now);
    if !self.blocked {
      if let Signal::Stop = send_some(&self.socket, &mut endpoint, now) {
        self.blocked = true;
      }
    }
    let mut events = Vec::new();
    while let Some(event) = endpoint.poll_event() {
      events.push(event);
    }
    Ok(events)
  }

  fn commands(&mut self) -> Option<Sender<()>> {
    match self.commands.try_recv() {
      Ok(Command::Shutdown { signal }) => {
        self.running = false;
        Some(signal)
      }
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => {
        self.running = false;
        None
      }
    }
  }

  /// Say goodbye to every peer, as far as the socket lets us.
  fn close_all(&mut self) {
    let now = Instant::now();
    let mut endpoint = self.shared.endpoint.lock();
    endpoint.close_all();
    send_some(&self.socket, &mut endpoint, now);
    if endpoint.has_pending_transmits() {
      log::debug!("socket is full, some sessions were closed without notice");
    }
  }
}

/// Ask the driver to stop, and wait until it did.
pub(crate) fn shutdown(shared: &Shared) -> Result<()> {
  if !shared.is_running() {
    return Err(Error::Shutdown);
  }
  let (signal, wait) = channel::bounded(0);
  shared
    .commands
    .send(Command::Shutdown { signal })
    .map_err(|_| Error::Shutdown)?;
  shared.wake();
  wait.recv().map_err(|_| Error::Shutdown)
}
