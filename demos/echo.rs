use anyhow::Result;
use berth::{Handler, Identity, Messages, SendFlags};
use std::{net::SocketAddr, thread, time::Duration};

fn init_log() -> Result<()> {
  // default RUST_LOG=info
  std::env::set_var(
    "RUST_LOG",
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
  );
  Ok(env_logger::try_init()?)
}

/// Accepts everyone who asks.
struct Accept(Messages);

impl Handler for Accept {
  fn on_session_request(&mut self, peer: &Identity) -> berth::Result<()> {
    log::info!("Accepting session with {}", peer);
    self.0.accept_session(peer);
    Ok(())
  }
}

/// Echo every message on channel 0 back to its sender.
///
/// Run with `cargo run --example echo`, then run `cargo run --example echo -- <addr>`
/// in another terminal to send a few messages to it.
fn main() -> Result<()> {
  init_log()?;

  let target = std::env::args().nth(1).map(|a| a.parse::<SocketAddr>()).transpose()?;
  let bind_addr: SocketAddr = match target {
    Some(_) => "127.0.0.1:0".parse()?,
    None => "127.0.0.1:9000".parse()?,
  };
  let (messages, handle) = berth::bind(bind_addr, Accept)?;
  log::info!("Listening on {}", messages.local_addr());

  match target {
    Some(addr) => {
      let server = Identity::Ip(addr);
      for n in 0..5 {
        let text = format!("hello #{n}");
        messages.send(&server, text.into_bytes(), SendFlags::RELIABLE, 0)?;
      }
      let mut echoed = 0;
      while echoed < 5 {
        for message in messages.receive(0, 16) {
          log::info!("Echoed '{}'", String::from_utf8_lossy(message.payload()));
          echoed += 1;
        }
        thread::sleep(Duration::from_millis(10));
      }
      messages.shutdown()?;
    }
    None => loop {
      for message in messages.receive(0, 16) {
        log::info!(
          "Received '{}' from {}",
          String::from_utf8_lossy(message.payload()),
          message.peer()
        );
        let peer = message.peer().clone();
        messages.send(&peer, message.into_payload(), SendFlags::RELIABLE, 0)?;
      }
      if handle.is_finished() {
        break;
      }
      thread::sleep(Duration::from_millis(10));
    },
  }

  handle.join().map_err(|_| anyhow::anyhow!("driver panicked"))??;
  Ok(())
}
