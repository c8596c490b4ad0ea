use mio::net::UdpSocket;
use std::{io, net::SocketAddr};

/// The datagram operations the driver needs from a socket.
pub trait Socket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Socket for UdpSocket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
    self.send_to(buf, target)
  }

  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    self.recv_from(buf)
  }
}

#[cfg(test)]
pub(crate) use memory::MemorySocket;

#[cfg(test)]
mod memory {
  use {
    super::Socket,
    std::{
      cell::{Cell, RefCell},
      collections::VecDeque,
      io,
      net::SocketAddr,
    },
  };

  /// In-memory socket which returns `WouldBlock` once it runs dry or full.
  pub struct MemorySocket {
    pub inbound: RefCell<VecDeque<io::Result<(Vec<u8>, SocketAddr)>>>,
    pub outbound: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
    /// How many more datagrams `send_to` accepts.
    pub send_capacity: Cell<usize>,
  }

  impl MemorySocket {
    pub fn new(send_capacity: usize) -> Self {
      Self {
        inbound: RefCell::new(VecDeque::new()),
        outbound: RefCell::new(Vec::new()),
        send_capacity: Cell::new(send_capacity),
      }
    }
  }

  impl Socket for MemorySocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
      if self.send_capacity.get() == 0 {
        return Err(io::ErrorKind::WouldBlock.into());
      }
      self.send_capacity.set(self.send_capacity.get() - 1);
      self.outbound.borrow_mut().push((buf.to_vec(), target));
      Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
      match self.inbound.borrow_mut().pop_front() {
        Some(Ok((data, from))) => {
          buf[..data.len()].copy_from_slice(&data);
          Ok((data.len(), from))
        }
        Some(Err(e)) => Err(e),
        None => Err(io::ErrorKind::WouldBlock.into()),
      }
    }
  }
}
