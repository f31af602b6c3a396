//! Top-level dispatch loop: handshake, worker startup, inbound-frame
//! routing, teardown on any fatal error, and (for the dialer role) the
//! reconnect wait.
use crate::config::{Config, Role};
use crate::control::ControlConnection;
use crate::error::{PolicyError, ProtocolError};
use crate::error_log;
use crate::frame::Frame;
use crate::keepalive::KeepAliveTicker;
use crate::port_listener::PortListener;
use crate::registry::CidRegistry;
use crate::tls::{Dialer, Listener, ReadWrite};
use crate::trace_log;
use crate::util::unwrap_some;
use crate::version;
use crate::{info_log, warn_log, TunnelResult};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Owns one process's side of the tunnel: either accepts control
/// connections forever (server role) or dials and reconnects forever
/// (client role). Each successful handshake produces one session's worth
/// of registry, port listeners and keep-alive ticker, torn down as a unit
/// when the session ends.
pub struct Session {
  config: Config,
}

impl Session {
  /// Takes ownership of an already-validated [`Config`].
  pub fn new(config: Config) -> Session {
    Session { config }
  }

  /// Runs forever. A fatal session error is logged and the supervisor loop
  /// re-enters at the top: re-accepting immediately in the server role, or
  /// waiting `--reconnect` seconds in the client role.
  pub fn run(&self) -> ! {
    match self.config.role.clone() {
      Role::Server { port } => self.run_server(port),
      Role::Client { host, port } => self.run_client(host, port),
    }
  }

  fn run_server(&self, port: u16) -> ! {
    let key = unwrap_some(self.config.key.as_deref());
    let listener = match Listener::bind(port, &self.config.cert, key) {
      Ok(listener) => listener,
      Err(e) => {
        error_log!("cidtun: failed to bind control listener on port {port}: {e}");
        std::process::exit(1);
      }
    };

    loop {
      match listener.accept() {
        Ok(stream) => {
          if let Err(e) = self.run_session(stream, true) {
            error_log!("cidtun: session ended: {e}");
          }
        }
        Err(e) => error_log!("cidtun: accept failed: {e}"),
      }
      // Listener role skips the reconnect wait: the next accept blocks anyway.
    }
  }

  fn run_client(&self, host: String, port: u16) -> ! {
    let dialer = match Dialer::new(host, port, &self.config.cert) {
      Ok(dialer) => dialer,
      Err(e) => {
        error_log!("cidtun: failed to build TLS client config: {e}");
        std::process::exit(1);
      }
    };

    loop {
      match dialer.connect() {
        Ok(stream) => {
          if let Err(e) = self.run_session(stream, false) {
            error_log!("cidtun: session ended: {e}");
          }
        }
        Err(e) => error_log!("cidtun: dial failed: {e}"),
      }
      thread::sleep(Duration::from_secs(self.config.reconnect));
    }
  }

  /// Runs one session to completion: handshake, dispatch loop, teardown.
  fn run_session(&self, stream: Box<dyn ReadWrite>, is_server: bool) -> TunnelResult<()> {
    let control = Arc::new(ControlConnection::new(stream));

    control.send_handshake(version::digest(), &self.config.forward)?;
    let (peer_digest, peer_ports) = control.recv_handshake()?;
    if peer_digest.as_slice() != version::digest().as_slice() {
      return Err(ProtocolError::VersionMismatch.into());
    }

    let registry = CidRegistry::new(control.clone(), is_server);

    // Each side's own --forward list is what it binds locally: a local
    // accept there announces a Connect the peer is expected to honor. The
    // ports *this* side may honor a Connect for are the ones the peer just
    // advertised to us in its half of the handshake, not our own list.
    let mut listeners: Vec<Arc<PortListener>> = Vec::with_capacity(self.config.forward.len());
    for &port in &self.config.forward {
      let bind_port = self.config.bind_port(port);
      match PortListener::bind(port, bind_port, registry.clone()) {
        Ok(listener) => listeners.push(listener),
        Err(e) => {
          error_log!("cidtun: failed to bind forward port {port} on local port {bind_port}: {e}");
          for listener in &listeners {
            let _ = listener.close();
          }
          return Err(e.into());
        }
      }
    }

    let keepalive = KeepAliveTicker::start(control.clone(), Duration::from_secs(self.config.keepalive));

    info_log!("cidtun: session established, peer advertises {} port(s)", peer_ports.len());
    let result = self.dispatch_loop(&control, &registry, &peer_ports);

    for listener in &listeners {
      let _ = listener.close();
    }
    let _ = registry.closeall();
    keepalive.close();

    result
  }

  fn dispatch_loop(
    &self,
    control: &Arc<ControlConnection>,
    registry: &Arc<CidRegistry>,
    peer_forward_ports: &[u16],
  ) -> TunnelResult<()> {
    loop {
      let frame = control.read_frame()?;
      match frame {
        Frame::Allocate => {
          let cid = registry.allocate()?;
          registry.write_frame(&Frame::Cid(cid))?;
        }
        Frame::Cid(cid) => registry.cid(cid)?,
        Frame::Connect { cid, port } => self.handle_connect(registry, cid, port, peer_forward_ports),
        Frame::Close(cid) => {
          registry.close(cid)?;
          registry.remove_cid(cid)?;
        }
        Frame::Data(cid, bytes) => registry.send(cid, &bytes)?,
        Frame::KeepAlive => trace_log!("cidtun: received keepalive"),
      }
    }
  }

  /// Handles an inbound `Connect`: dials `(target, port)` iff the peer
  /// advertised `port` to us during the handshake, otherwise rejects with a
  /// `Close` back to the peer and never attempts to dial. The two rejection
  /// reasons are distinct: a port outside the peer's advertised set is a
  /// policy violation, while a dial failure against an allowed port is a
  /// plain network error.
  fn handle_connect(
    &self,
    registry: &Arc<CidRegistry>,
    cid: u64,
    port: u64,
    peer_forward_ports: &[u16],
  ) {
    let allowed_port = u16::try_from(port).ok().filter(|p| peer_forward_ports.contains(p));

    let Some(port) = allowed_port else {
      let policy = PolicyError::PortNotForwarded(port);
      warn_log!("cidtun: rejecting connect for cid {cid}: {policy}");
      self.reject_connect(registry, cid);
      return;
    };

    match TcpStream::connect((self.config.target.as_str(), port)) {
      Ok(socket) => {
        if registry.create(cid, socket).is_ok() {
          let _ = registry.start(cid);
        }
      }
      Err(e) => {
        error_log!("cidtun: failed to dial target {}:{port} for cid {cid}: {e}", self.config.target);
        self.reject_connect(registry, cid);
      }
    }
  }

  /// Tells the peer the CID will go no further and forgets it locally.
  fn reject_connect(&self, registry: &Arc<CidRegistry>, cid: u64) {
    let _ = registry.write_frame(&Frame::Close(cid));
    let _ = registry.remove_cid(cid);
  }
}
