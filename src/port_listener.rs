//! One listener per advertised remote-forward port. Accepts local TCP,
//! allocates a CID, announces `Connect` on the control connection, then
//! starts a stream worker to pump the new connection's bytes.
use crate::error::{PolicyError, TunnelError, TunnelResult};
use crate::error_log;
use crate::frame::Frame;
use crate::info_log;
use crate::registry::CidRegistry;
use crate::util::{unspecified_to_loopback, unwrap_poison};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// Accepts local connections for one advertised forward port and bridges
/// each one into the tunnel.
pub struct PortListener {
  advertised_port: u16,
  /// Where `close()` dials to unblock a thread parked in `accept()`.
  wakeup_addr: SocketAddr,
  shutdown: Arc<AtomicBool>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl PortListener {
  /// Binds `("0.0.0.0", bind_port)` and spawns the accept loop. A bind
  /// failure is returned directly: the caller treats it as fatal to session
  /// startup, per this component's bind-failure contract. A collision with
  /// something already bound to `bind_port` is reported as a typed
  /// [`PolicyError::BindCollision`] rather than a bare `io::Error`.
  pub fn bind(
    advertised_port: u16,
    bind_port: u16,
    registry: Arc<CidRegistry>,
  ) -> TunnelResult<Arc<PortListener>> {
    let listener = TcpListener::bind(("0.0.0.0", bind_port)).map_err(|e| {
      if e.kind() == io::ErrorKind::AddrInUse {
        TunnelError::Policy(PolicyError::BindCollision(bind_port))
      } else {
        TunnelError::Network(e)
      }
    })?;
    let wakeup_addr = unspecified_to_loopback(listener.local_addr()?);
    info_log!("cidtun: forwarding advertised port {advertised_port} on local port {bind_port}");

    let shutdown = Arc::new(AtomicBool::new(false));
    let port_listener = Arc::new(PortListener {
      advertised_port,
      wakeup_addr,
      shutdown: shutdown.clone(),
      handle: Mutex::new(None),
    });

    let thread_handle = thread::Builder::new()
      .name(format!("cidtun-fwd-{advertised_port}"))
      .spawn(move || Self::accept_loop(listener, advertised_port, registry, shutdown))?;
    *unwrap_poison(port_listener.handle.lock())? = Some(thread_handle);
    Ok(port_listener)
  }

  fn accept_loop(
    listener: TcpListener,
    advertised_port: u16,
    registry: Arc<CidRegistry>,
    shutdown: Arc<AtomicBool>,
  ) {
    loop {
      let socket = match listener.accept() {
        Ok((socket, _)) => socket,
        Err(e) => {
          error_log!("cidtun: accept failed on forward {advertised_port}: {e}");
          break;
        }
      };

      // close()'s wakeup connection surfaces here too; the flag tells it
      // apart from a genuine accepted connection.
      if shutdown.load(Ordering::Relaxed) {
        break;
      }

      let cid = match registry.allocate() {
        Ok(cid) => cid,
        Err(e) => {
          error_log!("cidtun: cid allocation failed for forward {advertised_port}: {e}");
          break;
        }
      };

      if let Err(e) = registry.create(cid, socket) {
        error_log!("cidtun: failed to register stream for cid {cid}: {e}");
        continue;
      }

      if let Err(e) = registry.write_frame(&Frame::Connect { cid, port: u64::from(advertised_port) }) {
        error_log!("cidtun: failed to announce connect for forward {advertised_port} cid {cid}: {e}");
        break;
      }

      if let Err(e) = registry.start(cid) {
        error_log!("cidtun: failed to start stream worker for cid {cid}: {e}");
      }
    }
  }

  /// Closes the listening socket and joins the accept loop.
  pub fn close(&self) -> io::Result<()> {
    self.shutdown.store(true, Ordering::Relaxed);
    // The accept loop is parked in a blocking `accept()`; dialing ourselves
    // is the only portable way to wake it on stable std sockets.
    let _ = TcpStream::connect(self.wakeup_addr);
    let handle = unwrap_poison(self.handle.lock())?.take();
    if let Some(handle) = handle {
      let _ = handle.join();
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::ControlConnection;
  use crate::tls::ReadWrite;

  #[derive(Default)]
  struct NullStream;
  impl ReadWrite for NullStream {
    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
      Ok(0)
    }
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
      Ok(buf.len())
    }
    fn shutdown(&self) {}
  }

  #[test]
  fn bind_collision_is_reported_as_a_policy_error() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let control = Arc::new(ControlConnection::new(Box::new(NullStream)));
    let registry = CidRegistry::new(control, true);

    let err = PortListener::bind(port, port, registry).unwrap_err();
    assert!(matches!(err, TunnelError::Policy(PolicyError::BindCollision(p)) if p == port));
  }
}
