//! The messaging engine.
//!
//! [`Endpoint`] maps peer identities to sessions, routes datagrams to them,
//! and keeps the per-channel inbox that `receive` drains. It is a plain state
//! machine: every method takes the current time, and datagrams go in and out
//! through [`Endpoint::handle_datagram`] and [`Endpoint::poll_transmit`].

use {
  crate::{
    codec::Decode,
    config::Config,
    error::{Error, Result},
    identity::Identity,
    info::{Event, SessionInfo},
    message::{Message, SendFlags},
    packet::{CloseReason, Frame, Header, Packet},
    queue::Queue,
    session::{Expiry, Hello, Session},
  },
  bytes::Bytes,
  indexmap::IndexMap,
  std::{collections::VecDeque, net::SocketAddr, time::Instant},
};

/// A datagram ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmit {
  pub dst: SocketAddr,
  pub payload: Bytes,
}

pub struct Endpoint {
  config: Config,
  identity: Identity,
  local_addr: SocketAddr,
  sessions: IndexMap<Identity, Session>,
  /// local session id -> peer
  by_id: IndexMap<u32, Identity>,
  /// Addresses learned from handshakes.
  learned: IndexMap<Identity, SocketAddr>,
  inbox: IndexMap<u32, Queue<Message>>,
  transmits: VecDeque<Transmit>,
  events: VecDeque<Event>,
  next_id: u32,
  /// Index of the session that gets the first chance to transmit.
  cursor: usize,
}

impl Endpoint {
  pub fn new(config: Config, local_addr: SocketAddr) -> Self {
    let identity = config.identity.clone().unwrap_or(Identity::Ip(local_addr));
    Self {
      config,
      identity,
      local_addr,
      sessions: IndexMap::new(),
      by_id: IndexMap::new(),
      learned: IndexMap::new(),
      inbox: IndexMap::new(),
      transmits: VecDeque::new(),
      events: VecDeque::new(),
      next_id: rand::random(),
      cursor: 0,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn identity(&self) -> &Identity {
    &self.identity
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  fn alloc_id(&mut self) -> u32 {
    loop {
      self.next_id = self.next_id.wrapping_add(1);
      if self.next_id != 0 && !self.by_id.contains_key(&self.next_id) {
        return self.next_id;
      }
    }
  }

  fn insert_session(&mut self, session: Session) {
    self.by_id.insert(session.local_id, session.peer.clone());
    self.sessions.insert(session.peer.clone(), session);
  }

  fn remove_session(&mut self, peer: &Identity) -> Option<Session> {
    let session = self.sessions.swap_remove(peer)?;
    self.by_id.swap_remove(&session.local_id);
    Some(session)
  }

  fn route(&self, peer: &Identity) -> Option<SocketAddr> {
    peer
      .ip_addr()
      .or_else(|| self.learned.get(peer).copied())
      .or_else(|| self.config.routes.get(peer).copied())
  }

  /// Remember where `peer` was last heard from. Only the freshest
  /// `max_sessions` routes are kept.
  fn learn(&mut self, peer: Identity, addr: SocketAddr) {
    self.learned.shift_remove(&peer);
    self.learned.insert(peer, addr);
    while self.learned.len() > self.config.max_sessions.max(1) {
      if let Some((evicted, _)) = self.learned.shift_remove_index(0) {
        log::trace!("forgot the route to {}", evicted);
      }
    }
  }

  fn purge_inbox<F: Fn(&Message) -> bool>(&mut self, predicate: F) {
    for inbox in self.inbox.values_mut() {
      inbox.retain(|m| !predicate(m));
    }
    self.inbox.retain(|_, inbox| !inbox.is_empty());
  }

  /// Queue a message for `peer`, starting a session if there is none.
  pub fn send(
    &mut self,
    now: Instant,
    peer: &Identity,
    payload: Bytes,
    flags: SendFlags,
    channel: u32,
  ) -> Result<()> {
    if !peer.is_valid() || *peer == self.identity {
      return Err(Error::InvalidIdentity(peer.clone()));
    }
    let max = self.config.message_size_limit();
    if payload.len() > max {
      return Err(Error::MessageTooLarge { size: payload.len(), max });
    }

    match self.sessions.get(peer).map(Session::is_failed) {
      Some(true) => {
        if !flags.contains(SendFlags::AUTO_RESTART_BROKEN_SESSION) {
          return Err(Error::NoConnection(peer.clone()));
        }
        log::debug!("restarting broken session with {}", peer);
        self.remove_session(peer);
      }
      Some(false) => {}
      None => {}
    }

    if !self.sessions.contains_key(peer) {
      let addr = self.route(peer).ok_or_else(|| Error::NoRoute(peer.clone()))?;
      if self.sessions.len() >= self.config.max_sessions {
        return Err(Error::LimitExceeded("sessions"));
      }
      let id = self.alloc_id();
      log::debug!("session #{} connecting to {} at {}", id, peer, addr);
      self.insert_session(Session::connect(peer.clone(), addr, id, now, &self.config));
    }

    let session = self
      .sessions
      .get_mut(peer)
      .ok_or_else(|| Error::NoConnection(peer.clone()))?;
    // sending to a peer that asked for a session accepts it
    session.accept(now);
    session.queue(now, channel, payload, flags, &self.config)
  }

  /// Take up to `max` messages received on `channel`, oldest first.
  pub fn receive(&mut self, now: Instant, channel: u32, max: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(inbox) = self.inbox.get_mut(&channel) {
      messages.reserve(max.min(inbox.len()));
      while messages.len() < max {
        match inbox.get() {
          Some(message) => messages.push(message),
          None => break,
        }
      }
    }
    // messages held back by a full inbox
    let peers = self.sessions.keys().cloned().collect::<Vec<_>>();
    for peer in peers {
      self.deliver(&peer, Some(channel), now);
    }
    if self.inbox.get(&channel).is_some_and(Queue::is_empty) {
      self.inbox.swap_remove(&channel);
    }
    messages
  }

  /// Move completed messages from `peer`'s reassembly buffers to the inbox.
  fn deliver(&mut self, peer: &Identity, only: Option<u32>, now: Instant) {
    let Some(session) = self.sessions.get_mut(peer) else {
      return;
    };
    let capacity = self.config.inbox_capacity;
    for channel in session.channel_ids() {
      if only.is_some_and(|c| c != channel) {
        continue;
      }
      loop {
        if self.inbox.get(&channel).is_some_and(Queue::is_full) {
          let dropped = session.drop_ready_unreliable(channel);
          if dropped > 0 {
            log::trace!("inbox for channel {} is full, dropped {} unreliable messages", channel, dropped);
          }
          break;
        }
        let Some((number, reliable, payload)) = session.pop_ready(channel) else {
          break;
        };
        let message = Message::new(peer.clone(), channel, number, reliable, payload, now);
        self
          .inbox
          .entry(channel)
          .or_insert_with(|| Queue::new(capacity))
          .put(message);
      }
    }
  }

  /// Returns `false` if there is no session with `peer`, or it has failed.
  pub fn accept_session(&mut self, now: Instant, peer: &Identity) -> bool {
    match self.sessions.get_mut(peer) {
      Some(session) => {
        let accepted = session.accept(now);
        if accepted {
          log::debug!("accepted session with {}", peer);
        }
        accepted
      }
      None => false,
    }
  }

  /// Tear down the session with `peer`, dropping everything queued for or received from it.
  pub fn close_session(&mut self, peer: &Identity) -> bool {
    let Some(mut session) = self.remove_session(peer) else {
      return false;
    };
    log::debug!("closing session #{} with {}", session.local_id, peer);
    if let Some(packet) = session.close_packet(&self.config) {
      self.transmits.push_back(Transmit { dst: session.addr, payload: packet.to_bytes() });
    }
    self.purge_inbox(|m| m.peer() == peer);
    true
  }

  /// Close every session, as on shutdown.
  pub fn close_all(&mut self) {
    let peers = self.sessions.keys().cloned().collect::<Vec<_>>();
    for peer in peers {
      self.close_session(&peer);
    }
  }

  /// Close one channel. The session goes with its last open channel.
  pub fn close_channel(&mut self, now: Instant, peer: &Identity, channel: u32) -> bool {
    let Some(session) = self.sessions.get_mut(peer) else {
      return false;
    };
    if !session.close_channel(now, channel) {
      return false;
    }
    let last = !session.has_open_channels();
    self.purge_inbox(|m| m.peer() == peer && m.channel() == channel);
    if last {
      self.close_session(peer);
    }
    true
  }

  pub fn session_info(&self, now: Instant, peer: &Identity) -> SessionInfo {
    match self.sessions.get(peer) {
      Some(session) => SessionInfo {
        state: session.state(),
        connection: Some(session.info()),
        status: Some(session.status(now)),
      },
      None => SessionInfo::default(),
    }
  }

  pub fn handle_datagram(&mut self, now: Instant, addr: SocketAddr, datagram: Bytes) {
    let size = datagram.len();
    let packet = match Packet::decode(&mut datagram.clone()) {
      Ok(packet) => packet,
      Err(e) => {
        log::trace!("dropped datagram from {}: {}", addr, e);
        return;
      }
    };
    if packet.header.protocol != self.config.protocol.0 {
      log::trace!("dropped datagram from {}: protocol mismatch", addr);
      return;
    }
    if packet.header.dst == 0 {
      self.on_handshake(now, addr, packet);
    } else {
      self.on_session_packet(now, addr, packet, size);
    }
  }

  fn on_handshake(&mut self, now: Instant, addr: SocketAddr, packet: Packet) {
    let src = packet.header.src;
    let Some(Frame::Hello(announced)) = packet.frames.into_iter().next() else {
      log::trace!("dropped handshake from {}: no hello", addr);
      return;
    };
    // an address identity is only as good as the address the packet came from
    let peer = match announced {
      Identity::Ip(_) => Identity::Ip(addr),
      other => other,
    };
    if src == 0 || !peer.is_valid() || peer == self.identity {
      log::trace!("dropped handshake from {} claiming to be {}", addr, peer);
      return;
    }
    if !matches!(peer, Identity::Ip(_)) {
      self.learn(peer.clone(), addr);
    }

    let outcome = match self.sessions.get_mut(&peer) {
      Some(session) => {
        session.addr = addr;
        session.on_hello(now, src, &self.config)
      }
      None => Hello::Restarted,
    };
    match outcome {
      Hello::Known => {}
      Hello::Request => self.events.push_back(Event::SessionRequest { peer }),
      Hello::Restarted => {
        if self.remove_session(&peer).is_some() {
          log::debug!("{} started over", peer);
        }
        if self.sessions.len() >= self.config.max_sessions {
          log::debug!("ignoring session request from {}: too many sessions", peer);
          return;
        }
        let id = self.alloc_id();
        log::debug!("session #{} requested by {} at {}", id, peer, addr);
        self.insert_session(Session::requested(peer.clone(), addr, id, src, now, &self.config));
        self.events.push_back(Event::SessionRequest { peer });
      }
    }
  }

  fn on_session_packet(&mut self, now: Instant, addr: SocketAddr, packet: Packet, size: usize) {
    let dst = packet.header.dst;
    let Some(peer) = self.by_id.get(&dst).cloned() else {
      let needs_answer = packet
        .frames
        .iter()
        .any(|f| matches!(f, Frame::Segment(_) | Frame::Skip(_) | Frame::Welcome(_)));
      if needs_answer && packet.header.src != 0 {
        log::trace!("packet from {} for unknown session {}", addr, dst);
        let mut reply = Packet::new(Header {
          protocol: self.config.protocol.0,
          dst: packet.header.src,
          src: 0,
          packet_id: 0,
        });
        reply.frames.push(Frame::Close(CloseReason::UnknownSession));
        self.transmits.push_back(Transmit { dst: addr, payload: reply.to_bytes() });
      }
      return;
    };
    let Some(session) = self.sessions.get_mut(&peer) else {
      return;
    };
    if session.addr != addr {
      log::trace!("dropped packet for session #{} from unexpected address {}", dst, addr);
      return;
    }

    let open = session.on_packet(now, packet, size, &self.config);
    if let Some(info) = session.take_failure() {
      self.events.push_back(Event::SessionFailed { info });
    }
    if !open {
      self.remove_session(&peer);
      return;
    }
    self.deliver(&peer, None, now);
  }

  pub fn handle_timeout(&mut self, now: Instant) {
    let mut expired = Vec::new();
    for (peer, session) in self.sessions.iter_mut() {
      let expiry = session.handle_timeout(now, &self.config);
      if let Some(info) = session.take_failure() {
        self.events.push_back(Event::SessionFailed { info });
      }
      if expiry != Expiry::Alive {
        expired.push((peer.clone(), expiry));
      }
    }
    for (peer, expiry) in expired {
      let Some(mut session) = self.remove_session(&peer) else {
        continue;
      };
      log::debug!("session #{} with {} reclaimed", session.local_id, peer);
      if expiry == Expiry::Idle {
        if let Some(packet) = session.close_packet(&self.config) {
          self.transmits.push_back(Transmit { dst: session.addr, payload: packet.to_bytes() });
        }
      }
    }
  }

  /// Next datagram to send. Sessions take turns.
  pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
    if let Some(transmit) = self.transmits.pop_front() {
      return Some(transmit);
    }
    let len = self.sessions.len();
    for i in 0..len {
      let index = (self.cursor + i) % len;
      let Some((_, session)) = self.sessions.get_index_mut(index) else {
        continue;
      };
      if let Some(packet) = session.poll_transmit(now, &self.identity, &self.config) {
        self.cursor = index + 1;
        return Some(Transmit { dst: session.addr, payload: packet.to_bytes() });
      }
    }
    None
  }

  /// Put back a datagram the socket could not take. It goes out first next time.
  pub fn requeue(&mut self, transmit: Transmit) {
    self.transmits.push_front(transmit);
  }

  pub fn has_pending_transmits(&self) -> bool {
    !self.transmits.is_empty()
  }

  pub fn next_timeout(&self) -> Option<Instant> {
    self
      .sessions
      .values()
      .filter_map(|s| s.next_timeout(&self.config))
      .min()
  }

  pub fn poll_event(&mut self) -> Option<Event> {
    self.events.pop_front()
  }
}
