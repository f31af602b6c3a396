//! Single framed TLS stream carrying the tunnel's control-connection
//! frames. Writes are serialized by a mutex so stream workers and the
//! keep-alive ticker can emit frames concurrently without interleaving;
//! reads are the supervisor's alone and need no lock of their own.
use crate::codec::{read_bytes, read_packed_u64, write_bytes, write_packed_u64, FrameBuffer};
use crate::frame::Frame;
use crate::tls::ReadWrite;
use crate::util::unwrap_poison;
use std::io;
use std::io::Read;
use std::sync::Mutex;

/// Wraps a boxed TLS (or, in tests, in-memory) duplex stream and the write
/// scratch buffer frames are serialized into before hitting the wire.
pub struct ControlConnection {
  stream: Box<dyn ReadWrite>,
  write_scratch: Mutex<FrameBuffer>,
}

struct StreamReader<'a>(&'a dyn ReadWrite);

impl Read for StreamReader<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.0.read(buf)
  }
}

impl ControlConnection {
  /// Wraps an already-established duplex stream.
  pub fn new(stream: Box<dyn ReadWrite>) -> ControlConnection {
    ControlConnection { stream, write_scratch: Mutex::new(FrameBuffer::new()) }
  }

  fn reader(&self) -> StreamReader<'_> {
    StreamReader(self.stream.as_ref())
  }

  fn write_exact(&self, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
      let n = self.stream.write(buf)?;
      if n == 0 {
        return Err(io::Error::new(
          io::ErrorKind::WriteZero,
          "control connection accepted zero bytes",
        ));
      }
      buf = &buf[n..];
    }
    Ok(())
  }

  /// Encodes and writes `frame`, holding the write mutex for the whole call
  /// so no other writer can interleave its bytes.
  pub fn write_frame(&self, frame: &Frame) -> io::Result<()> {
    let mut scratch = unwrap_poison(self.write_scratch.lock())?;
    scratch.reset();
    frame.encode(&mut *scratch)?;
    self.write_exact(scratch.as_slice())
  }

  /// Reads one frame. Only ever called by the session supervisor thread;
  /// the control connection performs no locking on the read path.
  pub fn read_frame(&self) -> io::Result<Frame> {
    Frame::decode(&mut self.reader())
  }

  /// Sends this side's half of the handshake: digest length, digest bytes,
  /// port count, then each advertised port. Written as a single locked call
  /// so a concurrent frame write can never land in the middle of it.
  pub fn send_handshake(&self, digest: &[u8], ports: &[u16]) -> io::Result<()> {
    let mut scratch = unwrap_poison(self.write_scratch.lock())?;
    scratch.reset();
    write_bytes(&mut *scratch, digest)?;
    write_packed_u64(&mut *scratch, ports.len() as u64)?;
    for &port in ports {
      write_packed_u64(&mut *scratch, u64::from(port))?;
    }
    self.write_exact(scratch.as_slice())
  }

  /// Receives the peer's half of the handshake.
  pub fn recv_handshake(&self) -> io::Result<(Vec<u8>, Vec<u16>)> {
    let mut reader = self.reader();
    let digest = read_bytes(&mut reader)?;
    let count = read_packed_u64(&mut reader)?;
    let mut ports = Vec::with_capacity(count as usize);
    for _ in 0..count {
      let port = read_packed_u64(&mut reader)?;
      let port = u16::try_from(port)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "advertised port out of u16 range"))?;
      ports.push(port);
    }
    Ok((digest, ports))
  }

  /// Shuts down the underlying stream, unblocking any in-flight read/write
  /// and failing future calls.
  pub fn close(&self) {
    self.stream.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::{Arc, Mutex as StdMutex};

  #[derive(Default)]
  struct MockStream {
    read_data: StdMutex<VecDeque<u8>>,
    write_data: Arc<StdMutex<Vec<u8>>>,
  }

  impl MockStream {
    fn with_data(data: Vec<u8>) -> Self {
      MockStream { read_data: StdMutex::new(data.into()), write_data: Arc::new(StdMutex::new(Vec::new())) }
    }
  }

  impl ReadWrite for MockStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      let mut data = self.read_data.lock().unwrap();
      let n = buf.len().min(data.len());
      for slot in buf.iter_mut().take(n) {
        *slot = data.pop_front().unwrap();
      }
      Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
      self.write_data.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn shutdown(&self) {}
  }

  #[test]
  fn write_frame_lands_on_the_wire_in_one_piece() {
    let mock = MockStream::default();
    let written = mock.write_data.clone();
    let conn = ControlConnection::new(Box::new(mock));
    conn.write_frame(&Frame::Cid(42)).unwrap();

    let mut expected = Vec::new();
    Frame::Cid(42).encode(&mut expected).unwrap();
    assert_eq!(*written.lock().unwrap(), expected);
  }

  #[test]
  fn handshake_roundtrips_through_mock_stream() {
    let mut wire = Vec::new();
    write_bytes(&mut wire, b"0123456789012345678901234567890a").unwrap();
    write_packed_u64(&mut wire, 2).unwrap();
    write_packed_u64(&mut wire, 80).unwrap();
    write_packed_u64(&mut wire, 443).unwrap();
    let conn = ControlConnection::new(Box::new(MockStream::with_data(wire)));
    let (digest, ports) = conn.recv_handshake().unwrap();
    assert_eq!(digest, b"0123456789012345678901234567890a");
    assert_eq!(ports, vec![80, 443]);
  }
}
