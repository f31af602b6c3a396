//! Scenario 1 from the end-to-end list: a byte sequence written into one
//! side's locally forwarded port emerges unchanged from an echo server
//! dialed by the other side. `Session`'s handshake/dispatch orchestration is
//! private, so this test wires the same pieces (`ControlConnection`,
//! `CidRegistry`, `PortListener`) together directly over a real TCP pair
//! standing in for the TLS-wrapped control connection.
use cidtun::control::ControlConnection;
use cidtun::frame::Frame;
use cidtun::port_listener::PortListener;
use cidtun::registry::CidRegistry;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mock_stream::TcpReadWrite;

/// Connects a `TcpStream` pair standing in for the two ends of the
/// TLS-wrapped control connection between peers A and B.
fn control_pair() -> (Arc<ControlConnection>, Arc<ControlConnection>) {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let a = TcpStream::connect(addr).unwrap();
  let (b, _) = listener.accept().unwrap();
  let control_a = Arc::new(ControlConnection::new(Box::new(TcpReadWrite(Arc::new(a)))));
  let control_b = Arc::new(ControlConnection::new(Box::new(TcpReadWrite(Arc::new(b)))));
  (control_a, control_b)
}

/// A minimal stand-in for `Session`'s dispatch loop: routes every frame
/// except `Connect` to the registry, and dials `target_port` on `Connect`
/// iff it is in `accept_ports`.
fn dispatch(control: Arc<ControlConnection>, registry: Arc<CidRegistry>, accept_ports: Vec<u16>) {
  thread::spawn(move || loop {
    let frame = match control.read_frame() {
      Ok(frame) => frame,
      Err(_) => break,
    };
    match frame {
      Frame::Allocate => {
        if let Ok(cid) = registry.allocate() {
          let _ = registry.write_frame(&Frame::Cid(cid));
        }
      }
      Frame::Cid(cid) => {
        let _ = registry.cid(cid);
      }
      Frame::Connect { cid, port } => {
        let dialed = u16::try_from(port)
          .ok()
          .filter(|p| accept_ports.contains(p))
          .and_then(|p| TcpStream::connect(("127.0.0.1", p)).ok());
        match dialed {
          Some(socket) if registry.create(cid, socket).is_ok() => {
            let _ = registry.start(cid);
          }
          _ => {
            let _ = registry.write_frame(&Frame::Close(cid));
            let _ = registry.remove_cid(cid);
          }
        }
      }
      Frame::Close(cid) => {
        let _ = registry.close(cid);
        let _ = registry.remove_cid(cid);
      }
      Frame::Data(cid, bytes) => {
        let _ = registry.send(cid, &bytes);
      }
      Frame::KeepAlive => {}
    }
  });
}

fn spawn_echo_server(port: u16) {
  let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
  thread::spawn(move || {
    for stream in listener.incoming().flatten() {
      thread::spawn(move || {
        let mut stream = stream;
        let mut buf = [0u8; 1024];
        loop {
          let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
          };
          if stream.write_all(&buf[..n]).is_err() {
            break;
          }
        }
      });
    }
  });
}

#[test]
fn bytes_written_locally_echo_back_through_the_tunnel() {
  const ADVERTISED_PORT: u16 = 18071;
  const LOCAL_BIND_PORT: u16 = 18072;

  spawn_echo_server(ADVERTISED_PORT);

  let (control_a, control_b) = control_pair();
  // A is the listener (server) role and therefore the CID authority; B is
  // the dialer (client) role.
  let registry_a = CidRegistry::new(control_a.clone(), true);
  let registry_b = CidRegistry::new(control_b.clone(), false);

  // A forwards its own advertised port; B accepts Connects for whatever A
  // advertised to it (here hardcoded to mirror the single-port handshake).
  dispatch(control_a.clone(), registry_a.clone(), vec![]);
  dispatch(control_b.clone(), registry_b.clone(), vec![ADVERTISED_PORT]);

  let _listener = PortListener::bind(ADVERTISED_PORT, LOCAL_BIND_PORT, registry_a).unwrap();
  thread::sleep(Duration::from_millis(50));

  let mut client = TcpStream::connect(("127.0.0.1", LOCAL_BIND_PORT)).unwrap();
  client.write_all(b"hello").unwrap();

  let mut response = [0u8; 5];
  client.read_exact(&mut response).unwrap();
  assert_eq!(&response, b"hello");
}
