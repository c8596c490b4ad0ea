//! Session state reporting.

use {
  crate::{error::EndReason, identity::Identity},
  std::{net::SocketAddr, time::Duration},
};

/// High level state of a session, numbered like `ESteamNetworkingConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
  /// No session exists.
  #[default]
  None,
  /// Handshake in progress, or an inbound session waiting to be accepted.
  Connecting,
  FindingRoute,
  Connected,
  /// The peer ended the session.
  ClosedByPeer,
  /// Something went wrong on our end, usually a timeout.
  ProblemDetectedLocally,
}

impl ConnectionState {
  pub fn code(self) -> i32 {
    match self {
      ConnectionState::None => 0,
      ConnectionState::Connecting => 1,
      ConnectionState::FindingRoute => 2,
      ConnectionState::Connected => 3,
      ConnectionState::ClosedByPeer => 4,
      ConnectionState::ProblemDetectedLocally => 5,
    }
  }

  pub fn is_failed(self) -> bool {
    matches!(
      self,
      ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
  pub peer: Identity,
  pub addr: SocketAddr,
  pub state: ConnectionState,
  pub end_reason: Option<EndReason>,
  /// Human readable explanation of `end_reason`.
  pub end_debug: String,
  pub description: String,
}

/// Live transport statistics of a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RealTimeStatus {
  pub state: ConnectionState,
  /// Smoothed round trip time.
  pub ping: Duration,
  /// Fraction of sent packets that were not lost, from 0.0 to 1.0.
  pub quality_local: f32,
  pub packets_sent: u64,
  pub packets_received: u64,
  pub packets_lost: u64,
  pub bytes_sent: u64,
  pub bytes_received: u64,
  /// Congestion window, in bytes.
  pub cwnd: u64,
  pub bytes_in_flight: u64,
  pub pending_reliable: usize,
  pub pending_unreliable: usize,
  /// Reliable bytes sent but not yet acknowledged.
  pub sent_unacked_reliable: usize,
  /// Age of the oldest message still waiting to be sent.
  pub queue_time: Duration,
}

/// Result of a session state query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionInfo {
  pub state: ConnectionState,
  pub connection: Option<ConnectionInfo>,
  pub status: Option<RealTimeStatus>,
}

/// Asynchronous notification raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// A peer without a session wants to talk to us.
  ///
  /// Accept it with `accept_session`, or by sending to the peer.
  SessionRequest { peer: Identity },
  /// A session failed. Sends to the peer return `NoConnection` until the
  /// session is closed or reclaimed.
  SessionFailed { info: ConnectionInfo },
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  #[test]
  fn state_codes() {
    let states = [
      ConnectionState::None,
      ConnectionState::Connecting,
      ConnectionState::FindingRoute,
      ConnectionState::Connected,
      ConnectionState::ClosedByPeer,
      ConnectionState::ProblemDetectedLocally,
    ];
    let codes = states.iter().map(|s| s.code()).collect::<Vec<_>>();
    assert_eq!(codes, vec![0, 1, 2, 3, 4, 5]);
    assert!(ConnectionState::ClosedByPeer.is_failed());
    assert!(!ConnectionState::Connected.is_failed());
  }
}
