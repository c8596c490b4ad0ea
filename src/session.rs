//! Per-peer transport state.
//!
//! A [`Session`] owns everything the engine knows about one peer: the handshake
//! phase, outgoing chunks, packets in flight, received packet ids, and the
//! reassembly state of every channel. It never touches a socket. The endpoint
//! feeds it packets and timer ticks, and asks it for packets to send.

use {
  crate::{
    config::Config,
    error::{EndReason, Error, Result},
    identity::Identity,
    info::{ConnectionInfo, ConnectionState, RealTimeStatus},
    message::{self, Chunk, SendFlags},
    packet::{Ack, CloseReason, Frame, Header, Packet, Segment, Skip, MAX_HEADER_LEN, MAX_SEGMENT_OVERHEAD},
    path::{Latency, Window},
    reassembly::{Accept, Inbound},
    seq::Received,
  },
  bytes::Bytes,
  indexmap::IndexMap,
  std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
  },
};

/// A packet is lost once a packet sent this many ids later is acked.
const PACKET_THRESHOLD: u64 = 3;
/// Number of received packet ids remembered for duplicate detection and acks.
const RECEIVE_WINDOW: usize = 256;
/// Losses spanning this many packet timeouts count as persistent congestion.
const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Largest chunk that still fits into a datagram on its own.
pub fn max_chunk(mtu: usize) -> usize {
  mtu.saturating_sub(MAX_HEADER_LEN + 1 + MAX_SEGMENT_OVERHEAD).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// We sent `Hello` and are waiting for `Welcome`.
  Connecting,
  /// The peer sent `Hello`, and the application has not accepted it yet.
  Requested,
  Connected,
  Failed { state: ConnectionState, at: Instant },
}

/// What a `Hello` from the peer means for an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hello {
  /// Nothing new.
  Known,
  /// The peer is still waiting, and it is time to tell the application again.
  Request,
  /// The peer started over. The session must be replaced.
  Restarted,
}

/// What a timer tick means for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
  Alive,
  /// Remove without telling anyone.
  Reclaim,
  /// Remove, and tell the peer it may do the same.
  Idle,
}

#[derive(Default)]
struct Channel {
  open: bool,
  next_reliable: u64,
  next_unreliable: u64,
  inbound: Inbound,
}

struct SentPacket {
  sent_at: Instant,
  size: u64,
  /// Chunks to requeue if this packet is lost.
  reliable: Vec<Chunk>,
  skips: Vec<Skip>,
}

#[derive(Default)]
struct Stats {
  packets_sent: u64,
  packets_received: u64,
  packets_lost: u64,
  /// Packets that were tracked for loss.
  packets_tracked: u64,
  bytes_sent: u64,
  bytes_received: u64,
}

pub struct Session {
  pub peer: Identity,
  pub addr: SocketAddr,
  pub local_id: u32,
  pub remote_id: u32,
  phase: Phase,
  end: Option<(EndReason, String)>,
  failure_reported: bool,

  created_at: Instant,
  /// Last time anything arrived from the peer.
  last_recv: Instant,
  /// Last time a message was queued or received.
  last_activity: Instant,
  /// Last `Hello` while the session is waiting to be accepted.
  last_hello: Instant,
  last_request: Instant,
  next_hello: Instant,
  welcome_pending: bool,
  /// Since when data has been waiting to be sent or acked.
  busy_since: Option<Instant>,

  next_packet_id: u64,
  sent: BTreeMap<u64, SentPacket>,
  largest_acked: Option<u64>,
  received: Received,
  largest_recv_at: Option<Instant>,
  ack_dirty: bool,
  ack_deadline: Option<Instant>,

  outbound: VecDeque<Chunk>,
  retransmit: VecDeque<Chunk>,
  /// Bytes in `outbound` and `retransmit`
  queued_bytes: usize,
  flush_requested: bool,
  /// channel -> first reliable number still live, for channels closed by us
  skips: IndexMap<u32, u64>,

  channels: IndexMap<u32, Channel>,
  window: Window,
  latency: Latency,
  stats: Stats,
}

impl Session {
  fn new(peer: Identity, addr: SocketAddr, local_id: u32, phase: Phase, now: Instant, config: &Config) -> Self {
    Self {
      peer,
      addr,
      local_id,
      remote_id: 0,
      phase,
      end: None,
      failure_reported: false,
      created_at: now,
      last_recv: now,
      last_activity: now,
      last_hello: now,
      last_request: now,
      next_hello: now,
      welcome_pending: false,
      busy_since: None,
      next_packet_id: 0,
      sent: BTreeMap::new(),
      largest_acked: None,
      received: Received::new(RECEIVE_WINDOW),
      largest_recv_at: None,
      ack_dirty: false,
      ack_deadline: None,
      outbound: VecDeque::new(),
      retransmit: VecDeque::new(),
      queued_bytes: 0,
      flush_requested: false,
      skips: IndexMap::new(),
      channels: IndexMap::new(),
      window: Window::new(now, config.mtu as u64),
      latency: Latency::default(),
      stats: Stats::default(),
    }
  }

  /// A session we initiate. The first `Hello` goes out on the next transmit.
  pub fn connect(peer: Identity, addr: SocketAddr, local_id: u32, now: Instant, config: &Config) -> Self {
    Self::new(peer, addr, local_id, Phase::Connecting, now, config)
  }

  /// A session the peer initiated with a `Hello` from session `remote_id`.
  pub fn requested(
    peer: Identity,
    addr: SocketAddr,
    local_id: u32,
    remote_id: u32,
    now: Instant,
    config: &Config,
  ) -> Self {
    let mut session = Self::new(peer, addr, local_id, Phase::Requested, now, config);
    session.remote_id = remote_id;
    session
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn state(&self) -> ConnectionState {
    match self.phase {
      Phase::Connecting | Phase::Requested => ConnectionState::Connecting,
      Phase::Connected => ConnectionState::Connected,
      Phase::Failed { state, .. } => state,
    }
  }

  pub fn is_failed(&self) -> bool {
    matches!(self.phase, Phase::Failed { .. })
  }

  fn is_busy(&self) -> bool {
    !self.sent.is_empty()
      || !self.outbound.is_empty()
      || !self.retransmit.is_empty()
      || !self.skips.is_empty()
  }

  fn update_busy(&mut self, now: Instant) {
    if self.is_busy() {
      self.busy_since.get_or_insert(now);
    } else {
      self.busy_since = None;
    }
  }

  fn connected(&mut self, now: Instant) {
    log::debug!("session #{} with {} connected", self.local_id, self.peer);
    self.phase = Phase::Connected;
    self.last_recv = now;
    self.last_activity = now;
  }

  fn fail(&mut self, now: Instant, state: ConnectionState, reason: EndReason, debug: impl Into<String>) {
    if self.is_failed() {
      return;
    }
    let debug = debug.into();
    log::debug!("session #{} with {} failed: {}", self.local_id, self.peer, debug);
    self.phase = Phase::Failed { state, at: now };
    self.end = Some((reason, debug));
    self.discard_outbound();
    for channel in self.channels.values_mut() {
      channel.inbound.clear();
    }
  }

  fn discard_outbound(&mut self) {
    self.outbound.clear();
    self.retransmit.clear();
    self.skips.clear();
    self.queued_bytes = 0;
    self.flush_requested = false;
    for packet in std::mem::take(&mut self.sent).into_values() {
      self.window.discard(packet.size);
    }
    self.busy_since = None;
  }

  /// Connection info for a failure that was not handed out yet.
  pub fn take_failure(&mut self) -> Option<ConnectionInfo> {
    if self.is_failed() && !self.failure_reported {
      self.failure_reported = true;
      Some(self.info())
    } else {
      None
    }
  }

  /// Returns `false` if the session has failed.
  pub fn accept(&mut self, now: Instant) -> bool {
    match self.phase {
      Phase::Requested => {
        self.connected(now);
        self.welcome_pending = true;
        true
      }
      Phase::Connecting | Phase::Connected => true,
      Phase::Failed { .. } => false,
    }
  }

  pub fn on_hello(&mut self, now: Instant, src: u32, config: &Config) -> Hello {
    match self.phase {
      Phase::Requested => {
        if src != self.remote_id {
          return Hello::Restarted;
        }
        self.last_hello = now;
        self.last_recv = now;
        if now >= self.last_request + config.session_request_interval {
          self.last_request = now;
          Hello::Request
        } else {
          Hello::Known
        }
      }
      Phase::Connecting => {
        // both sides tried to connect at the same time
        self.remote_id = src;
        self.welcome_pending = true;
        self.connected(now);
        Hello::Known
      }
      Phase::Connected => {
        if src != self.remote_id {
          return Hello::Restarted;
        }
        // our `Welcome` got lost
        self.welcome_pending = true;
        self.last_recv = now;
        Hello::Known
      }
      Phase::Failed { .. } => Hello::Restarted,
    }
  }

  fn on_welcome(&mut self, now: Instant, src: u32, identity: Option<&Identity>) {
    if self.phase != Phase::Connecting {
      return;
    }
    if let Some(identity) = identity {
      let comparable = !matches!(self.peer, Identity::Ip(_)) && !matches!(identity, Identity::Ip(_));
      if comparable && *identity != self.peer {
        self.fail(
          now,
          ConnectionState::ProblemDetectedLocally,
          EndReason::Deviant,
          format!("expected {} but {} answered", self.peer, identity),
        );
        return;
      }
    }
    self.remote_id = src;
    self.connected(now);
  }

  /// Returns `false` if the peer closed the session.
  pub fn on_packet(&mut self, now: Instant, packet: Packet, size: usize, config: &Config) -> bool {
    let Packet { header, frames } = packet;
    if self.phase == Phase::Requested || self.is_failed() {
      return true;
    }
    if header.src == 0 {
      // the sender has no session for us, so it can only tell us that
      if frames.contains(&Frame::Close(CloseReason::UnknownSession)) {
        self.fail(
          now,
          ConnectionState::ClosedByPeer,
          EndReason::UnknownSession,
          "peer does not know this session",
        );
      }
      return true;
    }
    if self.remote_id != 0 && header.src != self.remote_id {
      log::trace!("session #{}: packet from stale session {}", self.local_id, header.src);
      return true;
    }
    let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
    if self.received.is_duplicate(header.packet_id) {
      if ack_eliciting {
        self.arm_ack(now, config);
      }
      return true;
    }

    self.last_recv = now;
    self.stats.packets_received += 1;
    self.stats.bytes_received += size as u64;

    let mut refused = false;
    for frame in frames {
      match frame {
        Frame::Hello(_) => {}
        Frame::Welcome(identity) => self.on_welcome(now, header.src, Some(&identity)),
        Frame::Ack(ack) => self.on_ack(now, &ack, config),
        Frame::Segment(segment) => {
          // data can only come from a peer that accepted us
          self.on_welcome(now, header.src, None);
          if !self.on_segment(now, &segment, config) {
            refused = true;
          }
        }
        Frame::Skip(skip) => {
          self.on_welcome(now, header.src, None);
          self.last_activity = now;
          let channel = self.channels.entry(skip.channel).or_default();
          let released = channel.inbound.skip_to(skip.next);
          log::trace!(
            "session #{}: peer skipped channel {} to {}, released {} bytes",
            self.local_id,
            skip.channel,
            skip.next,
            released
          );
        }
        Frame::Close(CloseReason::Normal) => {
          log::debug!("session #{} with {} closed by peer", self.local_id, self.peer);
          return false;
        }
        Frame::Close(CloseReason::UnknownSession) => {
          self.fail(
            now,
            ConnectionState::ClosedByPeer,
            EndReason::UnknownSession,
            "peer does not know this session",
          );
        }
      }
      if self.is_failed() {
        return true;
      }
    }

    // a packet with data we could not buffer is left unacked, so that it is sent again
    if !refused {
      let id = header.packet_id;
      self.received.insert(id);
      if self.received.largest() == Some(id) {
        self.largest_recv_at = Some(now);
      }
      if ack_eliciting {
        self.arm_ack(now, config);
      }
    }
    self.update_busy(now);
    true
  }

  fn arm_ack(&mut self, now: Instant, config: &Config) {
    self.ack_dirty = true;
    self.ack_deadline.get_or_insert(now + config.max_ack_delay);
  }

  fn recv_buffered(&self) -> usize {
    self.channels.values().map(|c| c.inbound.buffered()).sum()
  }

  /// Returns `false` if there is no room for the segment.
  fn on_segment(&mut self, now: Instant, segment: &Segment, config: &Config) -> bool {
    let budget = config.recv_buffer_size.saturating_sub(self.recv_buffered());
    let channel = self.channels.entry(segment.channel).or_default();
    channel.open = true;
    match channel.inbound.on_segment(segment, budget) {
      Accept::Stored => {
        self.last_activity = now;
        true
      }
      Accept::Full => false,
      Accept::Deviant => {
        self.fail(
          now,
          ConnectionState::ProblemDetectedLocally,
          EndReason::Deviant,
          format!(
            "conflicting sizes for message {} on channel {}",
            segment.number, segment.channel
          ),
        );
        true
      }
    }
  }

  fn on_ack(&mut self, now: Instant, ack: &Ack, config: &Config) {
    let Some(largest) = ack.ranges.first().map(|r| r.start) else {
      return;
    };
    if largest >= self.next_packet_id {
      log::trace!("session #{}: ack for unsent packet {}", self.local_id, largest);
      return;
    }
    if let Some(packet) = self.sent.get(&largest) {
      self
        .latency
        .update(now.saturating_duration_since(packet.sent_at), Duration::from_micros(ack.delay));
    }
    for range in &ack.ranges {
      let acked = self
        .sent
        .range(range.low()..=range.start)
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();
      for id in acked {
        if let Some(packet) = self.sent.remove(&id) {
          self.window.on_ack(packet.sent_at, packet.size);
        }
      }
    }
    self.largest_acked = Some(self.largest_acked.map_or(largest, |l| l.max(largest)));
    self.detect_lost(now, config);
  }

  fn packet_timeout(&self, config: &Config) -> Duration {
    self.latency.packet_timeout(config.max_ack_delay)
  }

  fn detect_lost(&mut self, now: Instant, config: &Config) {
    let timeout = self.packet_timeout(config);
    let largest_acked = self.largest_acked;
    let lost = self
      .sent
      .iter()
      .filter(|(id, packet)| {
        largest_acked.is_some_and(|l| **id + PACKET_THRESHOLD <= l) || packet.sent_at + timeout <= now
      })
      .map(|(id, _)| *id)
      .collect::<Vec<_>>();
    if lost.is_empty() {
      return;
    }

    let mut bytes = 0;
    let mut first: Option<Instant> = None;
    let mut last: Option<Instant> = None;
    for id in lost {
      let Some(packet) = self.sent.remove(&id) else {
        continue;
      };
      self.stats.packets_lost += 1;
      bytes += packet.size;
      first = Some(first.map_or(packet.sent_at, |t| t.min(packet.sent_at)));
      last = Some(last.map_or(packet.sent_at, |t| t.max(packet.sent_at)));
      for chunk in packet.reliable {
        self.queued_bytes += chunk.data.len();
        self.retransmit.push_back(chunk);
      }
      for skip in packet.skips {
        let next = self.skips.entry(skip.channel).or_insert(skip.next);
        *next = (*next).max(skip.next);
      }
    }
    if let (Some(first), Some(last)) = (first, last) {
      let persistent = last.saturating_duration_since(first) > timeout * PERSISTENT_CONGESTION_THRESHOLD;
      self.window.on_loss(now, last, bytes, persistent);
    }
  }

  /// Queue a message. Nothing is sent until the next transmit.
  pub fn queue(
    &mut self,
    now: Instant,
    channel: u32,
    payload: Bytes,
    flags: SendFlags,
    config: &Config,
  ) -> Result<()> {
    if self.queued_bytes + payload.len() > config.send_buffer_size {
      return Err(Error::LimitExceeded("send buffer"));
    }
    let reliable = flags.is_reliable();
    if !reliable
      && flags.contains(SendFlags::NO_DELAY)
      && (self.phase != Phase::Connected || !self.window.can_send())
    {
      log::trace!("session #{}: dropped no-delay message on channel {}", self.local_id, channel);
      return Ok(());
    }

    let state = self.channels.entry(channel).or_default();
    state.open = true;
    let counter = if reliable {
      &mut state.next_reliable
    } else {
      &mut state.next_unreliable
    };
    let number = *counter;
    *counter += 1;

    self.queued_bytes += payload.len();
    let chunks = message::split(payload, max_chunk(config.mtu), channel, reliable, number, now);
    self.outbound.extend(chunks);
    if flags.intersects(SendFlags::NO_NAGLE | SendFlags::NO_DELAY) {
      self.flush_requested = true;
    }
    self.last_activity = now;
    self.update_busy(now);
    Ok(())
  }

  /// Whether queued data should go out now rather than wait for more.
  fn data_due(&self, now: Instant, config: &Config) -> bool {
    if !self.retransmit.is_empty() || !self.skips.is_empty() {
      return true;
    }
    match self.outbound.front() {
      None => false,
      Some(oldest) => {
        self.flush_requested
          || self.queued_bytes >= max_chunk(config.mtu)
          || oldest.queued_at + config.nagle_delay <= now
      }
    }
  }

  fn header(&self, config: &Config, dst: u32) -> Header {
    Header {
      protocol: config.protocol.0,
      dst,
      src: self.local_id,
      packet_id: self.next_packet_id,
    }
  }

  fn ack_frame(&mut self, now: Instant) -> Frame {
    self.ack_dirty = false;
    self.ack_deadline = None;
    let delay = self
      .largest_recv_at
      .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
    Frame::Ack(Ack { delay, ranges: self.received.ranges() })
  }

  /// Build the next packet for this peer, if anything is due.
  pub fn poll_transmit(&mut self, now: Instant, identity: &Identity, config: &Config) -> Option<Packet> {
    match self.phase {
      Phase::Requested | Phase::Failed { .. } => return None,
      Phase::Connecting => {
        if now < self.next_hello {
          return None;
        }
        self.next_hello = now + config.handshake_interval;
        let mut packet = Packet::new(self.header(config, 0));
        packet.frames.push(Frame::Hello(identity.clone()));
        self.on_transmit(now, &packet, Vec::new(), Vec::new());
        return Some(packet);
      }
      Phase::Connected => {}
    }

    let mut packet = Packet::new(self.header(config, self.remote_id));
    if self.welcome_pending {
      self.welcome_pending = false;
      packet.frames.push(Frame::Welcome(identity.clone()));
    }
    let send_data = self.window.can_send() && self.data_due(now, config);
    let ack_due = self.ack_deadline.is_some_and(|d| d <= now);
    if self.ack_dirty && (ack_due || send_data || !packet.frames.is_empty()) {
      let frame = self.ack_frame(now);
      packet.frames.push(frame);
    }

    let mut reliable = Vec::new();
    let mut skips = Vec::new();
    if send_data {
      while let Some((&channel, &next)) = self.skips.first() {
        let skip = Skip { channel, next };
        if packet.encoded_len() + Frame::Skip(skip).encoded_len() > config.mtu {
          break;
        }
        self.skips.shift_remove_index(0);
        packet.frames.push(Frame::Skip(skip));
        skips.push(skip);
      }
      loop {
        let from_retransmit = !self.retransmit.is_empty();
        let next = if from_retransmit {
          self.retransmit.front()
        } else {
          self.outbound.front()
        };
        let Some(frame) = next.map(|chunk| Frame::Segment(Segment::from(chunk))) else {
          break;
        };
        if packet.encoded_len() + frame.encoded_len() > config.mtu {
          break;
        }
        let chunk = if from_retransmit {
          self.retransmit.pop_front()
        } else {
          self.outbound.pop_front()
        };
        let Some(chunk) = chunk else {
          break;
        };
        self.queued_bytes -= chunk.data.len();
        packet.frames.push(frame);
        if chunk.reliable {
          reliable.push(chunk);
        }
      }
      if self.outbound.is_empty() && self.retransmit.is_empty() {
        self.flush_requested = false;
      }
    }

    if packet.frames.is_empty() {
      return None;
    }
    self.on_transmit(now, &packet, reliable, skips);
    Some(packet)
  }

  fn on_transmit(&mut self, now: Instant, packet: &Packet, reliable: Vec<Chunk>, skips: Vec<Skip>) {
    let size = packet.encoded_len() as u64;
    if packet.is_ack_eliciting() {
      self.window.on_sent(size);
      self.stats.packets_tracked += 1;
      self.sent.insert(packet.header.packet_id, SentPacket { sent_at: now, size, reliable, skips });
    }
    self.next_packet_id += 1;
    self.stats.packets_sent += 1;
    self.stats.bytes_sent += size;
  }

  /// A best-effort goodbye. `None` if the peer does not know our session yet.
  pub fn close_packet(&mut self, config: &Config) -> Option<Packet> {
    if self.remote_id == 0 || self.is_failed() || self.phase == Phase::Requested {
      return None;
    }
    let mut packet = Packet::new(self.header(config, self.remote_id));
    packet.frames.push(Frame::Close(CloseReason::Normal));
    self.next_packet_id += 1;
    Some(packet)
  }

  pub fn handle_timeout(&mut self, now: Instant, config: &Config) -> Expiry {
    match self.phase {
      Phase::Requested => {
        if now >= self.last_hello + config.connect_timeout {
          log::debug!("session request from {} expired", self.peer);
          return Expiry::Reclaim;
        }
      }
      Phase::Connecting => {
        if now >= self.created_at + config.connect_timeout {
          self.fail(
            now,
            ConnectionState::ProblemDetectedLocally,
            EndReason::Timeout,
            "timed out waiting for the peer to accept",
          );
        }
      }
      Phase::Failed { at, .. } => {
        if now >= at + config.idle_timeout {
          return Expiry::Reclaim;
        }
      }
      Phase::Connected => {
        self.detect_lost(now, config);
        self.update_busy(now);
        match self.busy_since {
          Some(since) => {
            if now >= since.max(self.last_recv) + config.connection_timeout {
              self.fail(
                now,
                ConnectionState::ProblemDetectedLocally,
                EndReason::ProblemDetected,
                "peer stopped responding",
              );
            }
          }
          None => {
            if now >= self.last_activity + config.idle_timeout {
              log::debug!("session #{} with {} is idle", self.local_id, self.peer);
              return Expiry::Idle;
            }
          }
        }
      }
    }
    Expiry::Alive
  }

  /// Earliest instant at which `handle_timeout` or `poll_transmit` has work to do.
  pub fn next_timeout(&self, config: &Config) -> Option<Instant> {
    match self.phase {
      Phase::Requested => Some(self.last_hello + config.connect_timeout),
      Phase::Connecting => Some(self.next_hello.min(self.created_at + config.connect_timeout)),
      Phase::Failed { at, .. } => Some(at + config.idle_timeout),
      Phase::Connected => {
        let welcome = self.welcome_pending.then_some(self.created_at);
        let ack = self.ack_deadline.filter(|_| self.ack_dirty);
        let loss = self
          .sent
          .values()
          .map(|p| p.sent_at)
          .min()
          .map(|t| t + self.packet_timeout(config));
        let data = if !self.window.can_send() {
          None
        } else if !self.retransmit.is_empty()
          || !self.skips.is_empty()
          || (!self.outbound.is_empty()
            && (self.flush_requested || self.queued_bytes >= max_chunk(config.mtu)))
        {
          Some(self.created_at)
        } else {
          self.outbound.front().map(|c| c.queued_at + config.nagle_delay)
        };
        let life = match self.busy_since {
          Some(since) => since.max(self.last_recv) + config.connection_timeout,
          None => self.last_activity + config.idle_timeout,
        };
        [welcome, ack, loss, data, Some(life)].into_iter().flatten().min()
      }
    }
  }

  pub fn channel_ids(&self) -> Vec<u32> {
    self.channels.keys().copied().collect()
  }

  pub fn has_open_channels(&self) -> bool {
    self.channels.values().any(|c| c.open)
  }

  /// Next completed message on `channel`: `(number, reliable, payload)`.
  pub fn pop_ready(&mut self, channel: u32) -> Option<(u64, bool, Bytes)> {
    self.channels.get_mut(&channel)?.inbound.pop_ready()
  }

  pub fn drop_ready_unreliable(&mut self, channel: u32) -> usize {
    self
      .channels
      .get_mut(&channel)
      .map_or(0, |c| c.inbound.drop_ready_unreliable())
  }

  /// Drop everything queued or buffered for `channel`.
  ///
  /// Message numbering carries on, so the channel can be reopened later. The
  /// peer is told to stop waiting for reliable messages that will never come.
  /// Returns `false` if the channel is not open.
  pub fn close_channel(&mut self, now: Instant, channel: u32) -> bool {
    let Some(state) = self.channels.get_mut(&channel) else {
      return false;
    };
    if !state.open {
      return false;
    }
    state.open = false;
    state.inbound.clear();
    if state.next_reliable > 0 {
      self.skips.insert(channel, state.next_reliable);
    }
    self.outbound.retain(|c| c.channel != channel);
    self.retransmit.retain(|c| c.channel != channel);
    self.queued_bytes = self
      .outbound
      .iter()
      .chain(self.retransmit.iter())
      .map(|c| c.data.len())
      .sum();
    for packet in self.sent.values_mut() {
      packet.reliable.retain(|c| c.channel != channel);
    }
    self.update_busy(now);
    true
  }

  pub fn info(&self) -> ConnectionInfo {
    let (end_reason, end_debug) = match &self.end {
      Some((reason, debug)) => (Some(*reason), debug.clone()),
      None => (None, String::new()),
    };
    ConnectionInfo {
      peer: self.peer.clone(),
      addr: self.addr,
      state: self.state(),
      end_reason,
      end_debug,
      description: format!("session #{} with {}", self.local_id, self.peer),
    }
  }

  pub fn status(&self, now: Instant) -> RealTimeStatus {
    let pending = |reliable: bool| {
      self
        .outbound
        .iter()
        .chain(self.retransmit.iter())
        .filter(|c| c.reliable == reliable)
        .map(|c| c.data.len())
        .sum::<usize>()
    };
    let quality_local = if self.stats.packets_tracked == 0 {
      1.0
    } else {
      1.0 - self.stats.packets_lost as f32 / self.stats.packets_tracked as f32
    };
    RealTimeStatus {
      state: self.state(),
      ping: self.latency.smoothed(),
      quality_local: quality_local.max(0.0),
      packets_sent: self.stats.packets_sent,
      packets_received: self.stats.packets_received,
      packets_lost: self.stats.packets_lost,
      bytes_sent: self.stats.bytes_sent,
      bytes_received: self.stats.bytes_received,
      cwnd: self.window.get(),
      bytes_in_flight: self.window.in_flight(),
      pending_reliable: pending(true),
      pending_unreliable: pending(false),
      sent_unacked_reliable: self
        .sent
        .values()
        .flat_map(|p| p.reliable.iter())
        .map(|c| c.data.len())
        .sum(),
      queue_time: self
        .outbound
        .front()
        .map_or(Duration::ZERO, |c| now.saturating_duration_since(c.queued_at)),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::packet::Range,
    pretty_assertions::assert_eq,
    std::net::{Ipv4Addr, SocketAddrV4},
  };

  fn addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000))
  }

  fn me() -> Identity {
    Identity::SteamId(1)
  }

  /// An accepted inbound session, with the `Welcome` already sent.
  fn connected(now: Instant, config: &Config) -> Session {
    let mut session = Session::requested(Identity::SteamId(2), addr(), 10, 20, now, config);
    assert!(session.accept(now));
    let welcome = session.poll_transmit(now, &me(), config).unwrap();
    assert_eq!(welcome.frames, vec![Frame::Welcome(me())]);
    session
  }

  fn segments(packet: &Packet) -> Vec<&Segment> {
    packet
      .frames
      .iter()
      .filter_map(|f| match f {
        Frame::Segment(s) => Some(s),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn handshake_is_resent() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = Session::connect(Identity::SteamId(2), addr(), 10, now, &config);
    let hello = session.poll_transmit(now, &me(), &config).unwrap();
    assert_eq!(hello.header.dst, 0);
    assert_eq!(hello.header.src, 10);
    assert_eq!(hello.frames, vec![Frame::Hello(me())]);
    assert!(session.poll_transmit(now, &me(), &config).is_none());

    let later = now + config.handshake_interval;
    assert_eq!(session.next_timeout(&config), Some(later));
    assert!(session.poll_transmit(later, &me(), &config).is_some());
  }

  #[test]
  fn connect_times_out() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = Session::connect(Identity::SteamId(2), addr(), 10, now, &config);
    assert_eq!(session.handle_timeout(now + config.connect_timeout, &config), Expiry::Alive);
    let info = session.take_failure().unwrap();
    assert_eq!(info.state, ConnectionState::ProblemDetectedLocally);
    assert_eq!(info.end_reason, Some(EndReason::Timeout));
    // reported once
    assert!(session.take_failure().is_none());
    assert!(!session.accept(now));
  }

  #[test]
  fn small_messages_wait_for_nagle() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);

    session
      .queue(now, 0, Bytes::from_static(b"a"), SendFlags::UNRELIABLE, &config)
      .unwrap();
    session
      .queue(now, 0, Bytes::from_static(b"b"), SendFlags::RELIABLE, &config)
      .unwrap();
    assert!(session.poll_transmit(now, &me(), &config).is_none());
    assert_eq!(session.next_timeout(&config), Some(now + config.nagle_delay));

    let packet = session
      .poll_transmit(now + config.nagle_delay, &me(), &config)
      .unwrap();
    // both messages share one datagram
    assert_eq!(segments(&packet).len(), 2);
    assert_eq!(session.status(now).sent_unacked_reliable, 1);
  }

  #[test]
  fn no_nagle_flushes_immediately() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 3, Bytes::from_static(b"x"), SendFlags::RELIABLE_NO_NAGLE, &config)
      .unwrap();
    let packet = session.poll_transmit(now, &me(), &config).unwrap();
    assert_eq!(segments(&packet)[0].channel, 3);
    assert_eq!(packet.header.dst, 20);
  }

  #[test]
  fn large_messages_are_split() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    let payload = Bytes::from(vec![1u8; 3 * max_chunk(config.mtu)]);
    session
      .queue(now, 0, payload, SendFlags::RELIABLE, &config)
      .unwrap();
    for _ in 0..3 {
      let packet = session.poll_transmit(now, &me(), &config).unwrap();
      assert!(packet.encoded_len() <= config.mtu);
      assert_eq!(segments(&packet).len(), 1);
    }
    assert!(session.poll_transmit(now, &me(), &config).is_none());
  }

  #[test]
  fn lost_reliable_chunks_are_sent_again() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 0, Bytes::from_static(b"keep"), SendFlags::RELIABLE_NO_NAGLE, &config)
      .unwrap();
    session
      .queue(now, 1, Bytes::from_static(b"lose"), SendFlags::UNRELIABLE_NO_NAGLE, &config)
      .unwrap();
    let first = session.poll_transmit(now, &me(), &config).unwrap();
    assert_eq!(segments(&first).len(), 2);

    let deadline = session.next_timeout(&config).unwrap();
    assert!(deadline > now);
    assert_eq!(session.handle_timeout(deadline, &config), Expiry::Alive);
    let again = session.poll_transmit(deadline, &me(), &config).unwrap();
    let resent = segments(&again);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].data, Bytes::from_static(b"keep"));
    assert_eq!(session.status(deadline).packets_lost, 1);
  }

  #[test]
  fn acked_packets_are_forgotten() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 0, Bytes::from_static(b"data"), SendFlags::RELIABLE_NO_NAGLE, &config)
      .unwrap();
    let packet = session.poll_transmit(now, &me(), &config).unwrap();
    let id = packet.header.packet_id;

    let mut ack = Packet::new(Header { protocol: config.protocol.0, dst: 10, src: 20, packet_id: 0 });
    ack.frames.push(Frame::Ack(Ack { delay: 0, ranges: vec![Range { start: id, len: 0 }] }));
    let later = now + Duration::from_millis(30);
    assert!(session.on_packet(later, ack, 32, &config));
    let status = session.status(later);
    assert_eq!(status.sent_unacked_reliable, 0);
    assert_eq!(status.bytes_in_flight, 0);
    assert_eq!(status.ping, Duration::from_millis(30));
  }

  #[test]
  fn send_buffer_is_bounded() {
    let config = Config { send_buffer_size: 8, ..Config::default() };
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 0, Bytes::from_static(b"12345"), SendFlags::RELIABLE, &config)
      .unwrap();
    assert!(matches!(
      session.queue(now, 0, Bytes::from_static(b"6789"), SendFlags::RELIABLE, &config),
      Err(Error::LimitExceeded(_))
    ));
  }

  #[test]
  fn no_delay_is_dropped_while_connecting() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = Session::connect(Identity::SteamId(2), addr(), 10, now, &config);
    session
      .queue(now, 0, Bytes::from_static(b"x"), SendFlags::UNRELIABLE_NO_DELAY, &config)
      .unwrap();
    assert_eq!(session.status(now).pending_unreliable, 0);
    session
      .queue(now, 0, Bytes::from_static(b"y"), SendFlags::UNRELIABLE, &config)
      .unwrap();
    assert_eq!(session.status(now).pending_unreliable, 1);
  }

  #[test]
  fn closing_a_channel_drops_its_data() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 0, Bytes::from_static(b"zero"), SendFlags::RELIABLE, &config)
      .unwrap();
    session
      .queue(now, 1, Bytes::from_static(b"one"), SendFlags::RELIABLE, &config)
      .unwrap();
    assert!(session.close_channel(now, 0));
    assert!(!session.close_channel(now, 0));
    assert!(!session.close_channel(now, 7));
    assert_eq!(session.status(now).pending_reliable, 3);
    assert!(session.has_open_channels());
    assert!(session.close_channel(now, 1));
    assert!(!session.has_open_channels());
  }

  #[test]
  fn closing_a_channel_tells_the_peer_where_to_resume() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    session
      .queue(now, 1, Bytes::from_static(b"lost"), SendFlags::RELIABLE, &config)
      .unwrap();
    session
      .queue(now, 2, Bytes::from_static(b"u"), SendFlags::UNRELIABLE, &config)
      .unwrap();
    assert!(session.close_channel(now, 1));
    assert!(session.close_channel(now, 2));

    let packet = session.poll_transmit(now, &me(), &config).unwrap();
    assert_eq!(packet.frames, vec![Frame::Skip(Skip { channel: 1, next: 1 })]);
    assert!(segments(&packet).is_empty());
    assert!(session.poll_transmit(now, &me(), &config).is_none());

    // an unacked skip is sent again
    let deadline = session.next_timeout(&config).unwrap();
    assert_eq!(session.handle_timeout(deadline, &config), Expiry::Alive);
    let again = session.poll_transmit(deadline, &me(), &config).unwrap();
    assert_eq!(again.frames, vec![Frame::Skip(Skip { channel: 1, next: 1 })]);
  }

  #[test]
  fn idle_sessions_expire() {
    let config = Config::default();
    let now = Instant::now();
    let mut session = connected(now, &config);
    let deadline = session.next_timeout(&config).unwrap();
    assert_eq!(deadline, now + config.idle_timeout);
    assert_eq!(session.handle_timeout(deadline, &config), Expiry::Idle);
  }
}
