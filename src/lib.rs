//! Connectionless, session-multiplexed messaging over reliable UDP.
//!
//! Applications address peers by [`Identity`] and never manage connections:
//! the first [`Messages::send`] to a peer opens a session, the peer is asked to
//! accept it through [`Handler::on_session_request`], and sessions are torn
//! down when idle.

pub mod callback;
pub mod error;

mod codec;
mod config;
mod driver;
mod endpoint;
mod handler;
mod identity;
mod info;
mod message;
mod messages;
mod packet;
mod path;
mod queue;
mod reassembly;
mod seq;
mod session;
mod socket;
mod varint;

pub use {
  config::{Config, Role},
  error::{EndReason, Error, Result},
  handler::Handler,
  identity::{Identity, ParseError},
  info::{ConnectionInfo, ConnectionState, Event, RealTimeStatus, SessionInfo},
  message::{Message, SendFlags, MAX_MESSAGE_SIZE},
  messages::{bind, bind_with, Messages},
};

use std::{
  collections::hash_map::DefaultHasher,
  hash::{Hash, Hasher},
};

/// Tag carried by every packet. Endpoints drop packets with a different tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol(pub u64);

impl<T: Hash> From<T> for Protocol {
  fn from(v: T) -> Self {
    let mut s = DefaultHasher::new();
    v.hash(&mut s);
    Self(s.finish())
  }
}
