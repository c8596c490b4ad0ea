use {
  crate::identity::Identity,
  std::{error::Error as StdError, fmt::Debug, io},
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  #[error("invalid identity: {0}")]
  InvalidIdentity(Identity),
  #[error("no route to {0}")]
  NoRoute(Identity),
  #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
  MessageTooLarge { size: usize, max: usize },
  #[error("session with {0} is broken")]
  NoConnection(Identity),
  #[error("limit exceeded: {0}")]
  LimitExceeded(&'static str),
  #[error("the messaging driver has shut down")]
  Shutdown,
  #[error("User error: {0}")]
  User(Box<dyn StdError + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn custom<T>(err: T) -> Error
  where
    T: StdError + Send + Sync + 'static,
  {
    Error::User(Box::new(err))
  }

  pub fn downcast<T>(&self) -> Option<&T>
  where
    T: StdError + Send + Sync + 'static,
  {
    match self {
      Error::User(err) => err.downcast_ref(),
      _ => None,
    }
  }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
  /// The session was closed on purpose via `close_session` or `close_channel`.
  Normal,
  /// The handshake did not complete within `connect_timeout`.
  Timeout,
  /// Nothing was heard from the peer for `connection_timeout` while data was in flight.
  ProblemDetected,
  /// The peer answered that it has no session with us.
  UnknownSession,
  /// The remote side engaged in behavior deviating from the protocol. This may
  /// indicate mismatching versions, or more likely the peer is attempting to
  /// forge packets.
  Deviant,
}

impl EndReason {
  /// Numeric code in the `ESteamNetConnectionEnd` numbering.
  pub fn code(self) -> i32 {
    match self {
      EndReason::Normal => 1000,
      EndReason::ProblemDetected => 4001,
      EndReason::Deviant => 5001,
      EndReason::Timeout => 5003,
      EndReason::UnknownSession => 5010,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn create_and_print_custom_error_string() {
    use std::fmt::Write;
    #[derive(Debug, Error)]
    #[error("{0}")]
    struct MyError(&'static str);
    let input = MyError("test");
    let mut expected = String::new();
    write!(expected, "User error: {}", input).unwrap();

    let err = Error::custom(input);

    let mut actual = String::new();
    write!(actual, "{}", err).unwrap();

    assert_eq!(&expected, &actual)
  }

  #[allow(unreachable_patterns)]
  #[test]
  fn downcast_custom_error() {
    #[derive(Debug, Clone, Copy, PartialEq, Error)]
    #[error("{info}")]
    struct ErrorData {
      info: &'static str,
    }

    let input = ErrorData { info: "test" };
    let err = Error::custom(input);
    let output = match err.downcast::<ErrorData>() {
      Some(v) => *v,
      None => unreachable!(),
    };

    assert_eq!(input, output);
    assert!(Error::Shutdown.downcast::<ErrorData>().is_none());
  }

  #[test]
  fn messages_name_the_peer() {
    let peer = Identity::SteamId(7);
    assert_eq!(Error::NoRoute(peer.clone()).to_string(), "no route to steamid:7");
    assert_eq!(
      Error::NoConnection(peer).to_string(),
      "session with steamid:7 is broken"
    );
    assert_eq!(
      Error::MessageTooLarge { size: 10, max: 5 }.to_string(),
      "message of 10 bytes exceeds the maximum of 5 bytes"
    );
  }
}
