//! One worker per tunnelled TCP connection. Drains the local socket into
//! `Data` frames, reports local EOF as a `Close`, and absorbs cooperative
//! shutdown requests from the session without emitting a `Close` of its own.
use crate::error_log;
use crate::registry::RegistryHandle;
use crate::util::unwrap_poison;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// Read buffer size: one datagram-per-read, no fragmentation beyond it.
const READ_BUF_SIZE: usize = 16 * 1024 * 1024;

/// Owns one tunnelled connection's local TCP socket and the thread that
/// drains it. Holds a non-owning [`RegistryHandle`] back-reference to emit
/// frames and self-remove; the registry is what owns this worker.
pub struct StreamWorker {
  cid: u64,
  socket: Arc<TcpStream>,
  registry: Arc<dyn RegistryHandle>,
  closed: AtomicBool,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamWorker {
  /// Builds a worker bound to `(cid, socket)`. Does not start the read loop;
  /// call [`StreamWorker::start`] once the caller is ready for traffic.
  pub fn new(cid: u64, socket: TcpStream, registry: Arc<dyn RegistryHandle>) -> Arc<StreamWorker> {
    Arc::new(StreamWorker {
      cid,
      socket: Arc::new(socket),
      registry,
      closed: AtomicBool::new(false),
      handle: Mutex::new(None),
    })
  }

  /// Spawns the read loop on its own thread.
  pub fn start(self: &Arc<Self>) {
    let worker = Arc::clone(self);
    let cid = self.cid;
    let spawned =
      thread::Builder::new().name(format!("cidtun-stream-{cid}")).spawn(move || worker.run());
    match spawned {
      Ok(thread_handle) => {
        if let Ok(mut guard) = self.handle.lock() {
          *guard = Some(thread_handle);
        }
      }
      Err(e) => error_log!("cidtun: failed to spawn stream worker for cid {cid}: {e}"),
    }
  }

  fn run(self: Arc<Self>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
      let n = match (&*self.socket).read(&mut buf) {
        Ok(0) => break,
        Ok(n) => n,
        Err(_) => break,
      };
      if self.registry.emit_data(self.cid, buf[..n].to_vec()).is_err() {
        break;
      }
    }

    // Cooperative close already told the peer nothing further is coming
    // (or the peer initiated the teardown itself); only an uncooperative
    // exit needs to announce it.
    if !self.closed.load(Ordering::Relaxed) {
      let _ = self.registry.emit_close(self.cid);
      self.registry.remove(self.cid);
    }
  }

  /// Pushes peer-originated bytes onto the local socket.
  pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
    (&*self.socket).write_all(bytes)
  }

  /// Cooperative shutdown: marks the worker closed, shuts down both socket
  /// halves to unblock the read loop, and joins its thread.
  pub fn close(&self) {
    self.closed.store(true, Ordering::Relaxed);
    let _ = self.socket.shutdown(Shutdown::Both);
    let handle = match unwrap_poison(self.handle.lock()) {
      Ok(mut guard) => guard.take(),
      Err(_) => None,
    };
    if let Some(handle) = handle {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::TcpListener;
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;

  #[derive(Default)]
  struct RecordingHandle {
    data: StdMutex<Vec<(u64, Vec<u8>)>>,
    closes: StdMutex<Vec<u64>>,
    removed: StdMutex<Vec<u64>>,
  }

  impl RegistryHandle for RecordingHandle {
    fn emit_data(&self, cid: u64, bytes: Vec<u8>) -> io::Result<()> {
      self.data.lock().unwrap().push((cid, bytes));
      Ok(())
    }
    fn emit_close(&self, cid: u64) -> io::Result<()> {
      self.closes.lock().unwrap().push(cid);
      Ok(())
    }
    fn remove(&self, cid: u64) {
      self.removed.lock().unwrap().push(cid);
    }
  }

  fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
  }

  #[test]
  fn uncooperative_eof_emits_close_and_removes() {
    let (local, remote) = connected_pair();
    let handle = Arc::new(RecordingHandle::default());
    let worker = StreamWorker::new(7, local, handle.clone());
    worker.start();
    drop(remote); // peer hangs up -> worker observes EOF
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*handle.closes.lock().unwrap(), vec![7]);
    assert_eq!(*handle.removed.lock().unwrap(), vec![7]);
  }

  #[test]
  fn data_read_from_socket_is_forwarded_through_the_registry() {
    let (local, mut remote) = connected_pair();
    let handle = Arc::new(RecordingHandle::default());
    let worker = StreamWorker::new(3, local, handle.clone());
    worker.start();
    remote.write_all(b"hello").unwrap();
    thread::sleep(Duration::from_millis(100));
    worker.close();
    let seen = handle.data.lock().unwrap();
    assert_eq!(seen.iter().map(|(_, b)| b.as_slice()).collect::<Vec<_>>(), vec![b"hello".as_slice()]);
  }

  #[test]
  fn cooperative_close_does_not_emit_close() {
    let (local, _remote) = connected_pair();
    let handle = Arc::new(RecordingHandle::default());
    let worker = StreamWorker::new(9, local, handle.clone());
    worker.start();
    worker.close();
    assert!(handle.closes.lock().unwrap().is_empty());
    assert!(handle.removed.lock().unwrap().is_empty());
  }

  #[test]
  fn send_writes_to_the_local_socket() {
    let (local, mut remote) = connected_pair();
    let handle = Arc::new(RecordingHandle::default());
    let worker = StreamWorker::new(1, local, handle);
    worker.send(b"world").unwrap();
    let mut buf = [0u8; 5];
    remote.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");
  }
}
