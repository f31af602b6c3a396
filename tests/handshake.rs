//! Scenario 4 from the end-to-end list: two peers whose version digests
//! disagree detect the mismatch from the handshake payload alone, before
//! any frame dispatch begins.
use cidtun::control::ControlConnection;
use cidtun::version;
use std::io::Write;

use mock_stream::MockStream;

fn wire_for_handshake(digest: &[u8], ports: &[u16]) -> Vec<u8> {
  let mut wire = Vec::new();
  cidtun::codec::write_bytes(&mut wire, digest).unwrap();
  cidtun::codec::write_packed_u64(&mut wire, ports.len() as u64).unwrap();
  for &port in ports {
    cidtun::codec::write_packed_u64(&mut wire, u64::from(port)).unwrap();
  }
  wire
}

#[test]
fn matching_digests_and_forward_ports_round_trip() {
  let wire = wire_for_handshake(version::digest(), &[80, 443]);
  let conn = ControlConnection::new(Box::new(MockStream::with_data(wire)));
  let (digest, ports) = conn.recv_handshake().unwrap();
  assert_eq!(digest.as_slice(), version::digest().as_slice());
  assert_eq!(ports, vec![80, 443]);
}

#[test]
fn mismatched_digest_is_observable_from_the_received_handshake() {
  let foreign_digest = {
    let mut d = *version::digest();
    d[0] ^= 0xff;
    d
  };
  let wire = wire_for_handshake(&foreign_digest, &[]);
  let conn = ControlConnection::new(Box::new(MockStream::with_data(wire)));
  let (peer_digest, _) = conn.recv_handshake().unwrap();
  assert_ne!(peer_digest.as_slice(), version::digest().as_slice());
}

#[test]
fn send_handshake_writes_digest_length_then_digest_then_ports() {
  let mock = MockStream::without_data();
  let conn = ControlConnection::new(Box::new(mock.clone()));
  conn.send_handshake(version::digest(), &[22]).unwrap();

  let mut expected = Vec::new();
  expected.write_all(&wire_for_handshake(version::digest(), &[22])).unwrap();
  assert_eq!(mock.copy_written_data(), expected);
}
