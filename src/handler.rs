use {
  crate::{
    error::{Error, Result},
    identity::Identity,
    info::{ConnectionInfo, Event},
  },
  crossbeam::channel::Sender,
};

/// Receives session notifications on the driver thread.
///
/// The engine is not locked while a handler method runs, so it may call back
/// into [`Messages`](crate::Messages), for example to accept a session.
/// It must not call [`Messages::shutdown`](crate::Messages::shutdown), which
/// waits for the driver thread.
pub trait Handler {
  /// Called when a peer without a session starts a handshake.
  ///
  /// Accept with `accept_session` or by sending to the peer. Ignored requests
  /// are raised again while the peer keeps trying, and eventually expire.
  fn on_session_request(&mut self, peer: &Identity) -> Result<(), Error> {
    log::info!("session request from {}", peer);
    Ok(())
  }
  /// Called when a session fails. Closed and idle sessions are not reported.
  fn on_session_failed(&mut self, info: &ConnectionInfo) -> Result<(), Error> {
    log::warn!("{} failed: {}", info.description, info.end_debug);
    Ok(())
  }
  /// Called when the driver encounters an error, including those returned by the
  /// user-implemented handler methods.
  ///
  /// The driver treats all errors as unrecoverable.
  fn on_error(&mut self, error: &Error) {
    log::error!("{}", error);
  }
}

/// Log every notification.
impl Handler for () {}

/// Forward every notification to a channel.
impl Handler for Sender<Event> {
  fn on_session_request(&mut self, peer: &Identity) -> Result<()> {
    forward(self, Event::SessionRequest { peer: peer.clone() });
    Ok(())
  }

  fn on_session_failed(&mut self, info: &ConnectionInfo) -> Result<()> {
    forward(self, Event::SessionFailed { info: info.clone() });
    Ok(())
  }
}

fn forward(sender: &Sender<Event>, event: Event) {
  if sender.send(event).is_err() {
    log::debug!("event receiver is gone");
  }
}

/// Hand `event` to the matching handler method.
pub(crate) fn dispatch<H: Handler>(handler: &mut H, event: &Event) -> Result<()> {
  match event {
    Event::SessionRequest { peer } => handler.on_session_request(peer),
    Event::SessionFailed { info } => handler.on_session_failed(info),
  }
}
