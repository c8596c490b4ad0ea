//! Congestion window and latency estimation for a single session.
//!
//! The window is a New Reno style controller, based on the one in quinn-proto.

use std::time::{Duration, Instant};

pub struct Window {
  cwnd: u64,
  ssthresh: u64,
  acked: u64,
  recovery: Instant,
  in_flight: u64,
  mtu: u64,
}

impl Window {
  pub fn new(now: Instant, mtu: u64) -> Self {
    Self {
      cwnd: Self::initial(mtu),
      ssthresh: u64::MAX,
      acked: 0,
      recovery: now,
      in_flight: 0,
      mtu,
    }
  }

  fn initial(mtu: u64) -> u64 {
    10 * mtu
  }

  fn minimum(&self) -> u64 {
    2 * self.mtu
  }

  /// Current window size in bytes.
  pub fn get(&self) -> u64 {
    self.cwnd
  }

  pub fn in_flight(&self) -> u64 {
    self.in_flight
  }

  /// Whether one more datagram fits into the window.
  pub fn can_send(&self) -> bool {
    self.in_flight < self.cwnd
  }

  pub fn on_sent(&mut self, bytes: u64) {
    self.in_flight += bytes;
  }

  pub fn on_ack(&mut self, sent_at: Instant, bytes: u64) {
    self.in_flight = self.in_flight.saturating_sub(bytes);
    if sent_at <= self.recovery {
      return;
    }

    if self.cwnd < self.ssthresh {
      // slow start
      self.cwnd = self.cwnd.saturating_add(bytes);
      if self.cwnd >= self.ssthresh {
        // exit slow start
        self.acked = self.cwnd - self.ssthresh;
      }
    } else {
      // congestion avoidance
      self.acked += bytes;
      if self.acked >= self.cwnd {
        self.acked -= self.cwnd;
        self.cwnd += self.mtu;
      }
    }
  }

  /// Persistent congestion means everything sent over a span of several
  /// packet timeouts was lost.
  pub fn on_loss(&mut self, now: Instant, sent_at: Instant, bytes: u64, is_persistent: bool) {
    self.in_flight = self.in_flight.saturating_sub(bytes);
    if sent_at <= self.recovery {
      return;
    }

    // enter recovery state.
    self.recovery = now;
    self.cwnd = u64::max(self.minimum(), self.cwnd / 2);
    self.ssthresh = self.cwnd;

    // upon persistent loss, reset the window to minimum
    // this may cause the window to re-enter the `slow start` state.
    if is_persistent {
      self.cwnd = self.minimum();
    }
  }

  /// Forget about bytes that will never be acked, e.g. when a session is torn down.
  pub fn discard(&mut self, bytes: u64) {
    self.in_flight = self.in_flight.saturating_sub(bytes);
  }
}

pub struct Latency {
  /// The latency variance
  variance: Duration,
  /// The minimum observed latency
  min: Duration,
  /// Last latency measurement
  last: Duration,
  /// The smoothed latency
  smooth: Option<Duration>,
}

impl Default for Latency {
  fn default() -> Self {
    let initial = Duration::from_millis(333);
    Self {
      variance: initial / 2,
      min: initial,
      last: initial,
      smooth: None,
    }
  }
}

impl Latency {
  /// Best latency estimate available
  #[inline]
  pub fn get(&self) -> Duration {
    self.smooth.unwrap_or(self.last).max(self.last)
  }

  /// Smoothed round trip time, or the initial guess if nothing was measured yet.
  pub fn smoothed(&self) -> Duration {
    self.smooth.unwrap_or(self.last)
  }

  /// How long a sender should wait before treating a packet as lost
  #[inline]
  pub fn packet_timeout(&self, delay: Duration) -> Duration {
    self.get() + std::cmp::max(4 * self.variance, Duration::from_millis(2)) + delay
  }

  // Based on RFC6298
  /// Update the latency estimate
  ///
  /// - latency: Time between the sender sending a packet and receiving an acknowledgement for it
  /// - delay: Time between the receiver receiving a packet and sending an acknowledgement for it
  pub fn update(&mut self, latency: Duration, delay: Duration) {
    self.last = latency;
    self.min = std::cmp::min(self.min, latency);
    if let Some(smooth) = self.smooth {
      let delay_adjusted = if self.min + delay <= self.last {
        self.last - delay
      } else {
        self.last
      };
      let variance_sample = if smooth > delay_adjusted {
        smooth - delay_adjusted
      } else {
        delay_adjusted - smooth
      };
      self.variance = (3 * self.variance + variance_sample) / 4;
      self.smooth = Some((7 * smooth + delay_adjusted) / 8);
    } else {
      self.smooth = Some(self.last);
      self.variance = self.last / 2;
      self.min = self.last;
    }
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  const MTU: u64 = 1200;

  struct Wait(Instant);
  impl Wait {
    fn new() -> Self {
      Self(Instant::now())
    }
    fn wait(&mut self, duration: Duration) {
      self.0 += duration;
    }
    fn get(&self) -> Instant {
      self.0
    }
  }

  macro_rules! ms {
    ($v:literal) => {
      Duration::from_millis($v)
    };
  }

  #[test]
  fn window_limits_bytes_in_flight() {
    let now = Wait::new();
    let mut wnd = Window::new(now.get(), MTU);
    assert_eq!(wnd.get(), 10 * MTU);

    for _ in 0..10 {
      assert!(wnd.can_send());
      wnd.on_sent(MTU);
    }
    assert!(!wnd.can_send());
    assert_eq!(wnd.in_flight(), 10 * MTU);
  }

  #[test]
  fn some_loss() {
    let mut now = Wait::new();
    let mut wnd = Window::new(now.get(), MTU);
    wnd.on_sent(4 * MTU);

    // successfully deliver a few datagrams: slow start grows the window by every acked byte
    now.wait(ms!(10));
    wnd.on_ack(now.get(), 3 * MTU);
    assert_eq!(wnd.get(), 13 * MTU);
    assert_eq!(wnd.in_flight(), MTU);

    // then lose one
    let sent_at = now.get();
    now.wait(ms!(10));
    wnd.on_loss(now.get(), sent_at, MTU, false);
    assert_eq!(wnd.get(), 6 * MTU + MTU / 2);
    assert_eq!(wnd.in_flight(), 0);

    // a second loss of something sent before recovery started changes nothing
    wnd.on_loss(now.get(), sent_at, 0, false);
    assert_eq!(wnd.get(), 6 * MTU + MTU / 2);

    // congestion avoidance: one MTU per full window acknowledged
    now.wait(ms!(10));
    let bytes = wnd.get();
    wnd.on_ack(now.get(), bytes);
    assert_eq!(wnd.get(), 7 * MTU + MTU / 2);
  }

  #[test]
  fn persistent_loss() {
    // under very bad conditions, up to 100% of packets may be dropped for a short period of time
    // this is "persistent" loss, and it is handled by dropping the window to the bare minimum,
    // and switching to the slow start state.

    let mut now = Wait::new();
    let mut wnd = Window::new(now.get(), MTU);

    now.wait(ms!(10));
    wnd.on_ack(now.get(), 2 * MTU);
    assert_eq!(wnd.get(), 12 * MTU);

    let sent_at = now.get();
    now.wait(ms!(10));
    wnd.on_loss(now.get(), sent_at, MTU, true);
    assert_eq!(wnd.get(), 2 * MTU);
    assert_eq!(wnd.ssthresh, 6 * MTU);

    // slow start again until the threshold
    now.wait(ms!(10));
    wnd.on_ack(now.get(), 4 * MTU);
    assert_eq!(wnd.get(), 6 * MTU);

    now.wait(ms!(10));
    let bytes = wnd.get();
    wnd.on_ack(now.get(), bytes);
    assert_eq!(wnd.get(), 7 * MTU);
  }

  #[test]
  fn latency_first_sample_replaces_guess() {
    let mut latency = Latency::default();
    assert_eq!(latency.smoothed(), ms!(333));
    latency.update(ms!(40), ms!(0));
    assert_eq!(latency.smoothed(), ms!(40));
    assert_eq!(latency.get(), ms!(40));
    assert_eq!(latency.packet_timeout(ms!(10)), ms!(40) + 4 * ms!(20) + ms!(10));
  }

  #[test]
  fn latency_smooths_and_subtracts_ack_delay() {
    let mut latency = Latency::default();
    latency.update(ms!(40), ms!(0));
    // 60ms round trip, of which 10ms was spent waiting to ack
    latency.update(ms!(60), ms!(10));
    // smooth = (7 * 40 + 50) / 8
    assert_eq!(latency.smoothed(), Duration::from_micros(41_250));
    // the last raw sample is higher, and `get` is pessimistic
    assert_eq!(latency.get(), ms!(60));
  }
}
