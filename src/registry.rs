//! CID registry: hands out channel IDs, tracks the live CID -> stream map,
//! mediates the client/server `Allocate`/`Cid` handshake, and recycles
//! server-side CIDs only after a cooldown window has elapsed.
use crate::control::ControlConnection;
use crate::frame::Frame;
use crate::stream_worker::StreamWorker;
use crate::util::unwrap_poison;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Minimum delay before a released server-side CID may be reissued.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Polling granularity for a blocked client-role `allocate()`.
const ALLOCATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Non-owning interface a [`StreamWorker`] uses to talk back to the registry
/// that owns it: emit frames for its CID and self-remove on exit. The
/// registry owns its workers; workers never own the registry back, they only
/// see it through this trait object.
pub trait RegistryHandle: Send + Sync {
  /// Emits a `Data(cid, bytes)` frame on the control connection.
  fn emit_data(&self, cid: u64, bytes: Vec<u8>) -> io::Result<()>;
  /// Emits a `Close(cid)` frame on the control connection.
  fn emit_close(&self, cid: u64) -> io::Result<()>;
  /// Unregisters `cid`, e.g. after the worker observed local EOF.
  fn remove(&self, cid: u64);
}

struct CidSlot {
  active: bool,
  last_deactivated: Option<Instant>,
}

#[derive(Default)]
struct State {
  /// Server-role CID slots, indexed by CID. Empty in client role.
  slots: Vec<CidSlot>,
  streams: HashMap<u64, Arc<StreamWorker>>,
  /// Client-role FIFO of CIDs received via `Cid` frames, awaiting a blocked `allocate()`.
  pending_cids: VecDeque<u64>,
}

/// Tracks live tunnelled streams and mediates CID allocation for one session.
pub struct CidRegistry {
  control: Arc<ControlConnection>,
  is_server: bool,
  state: Mutex<State>,
}

impl CidRegistry {
  /// `is_server` is the handshake's role flag: true iff this side is the
  /// listener role, and therefore the sole authority for CID numbering.
  pub fn new(control: Arc<ControlConnection>, is_server: bool) -> Arc<CidRegistry> {
    Arc::new(CidRegistry { control, is_server, state: Mutex::new(State::default()) })
  }

  /// Hands out a fresh CID. On the server this is a first-free-index scan
  /// over the cooldown-aware slot list; on the client it emits `Allocate`
  /// and polls for the reply the supervisor delivers via [`CidRegistry::cid`].
  pub fn allocate(&self) -> io::Result<u64> {
    if self.is_server {
      let mut state = unwrap_poison(self.state.lock())?;
      for (cid, slot) in state.slots.iter_mut().enumerate() {
        if !slot.active && slot.last_deactivated.is_some_and(|t| t.elapsed() >= COOLDOWN) {
          slot.active = true;
          slot.last_deactivated = None;
          return Ok(cid as u64);
        }
      }
      let cid = state.slots.len() as u64;
      state.slots.push(CidSlot { active: true, last_deactivated: None });
      return Ok(cid);
    }

    self.control.write_frame(&Frame::Allocate)?;
    loop {
      {
        let mut state = unwrap_poison(self.state.lock())?;
        if let Some(cid) = state.pending_cids.pop_front() {
          return Ok(cid);
        }
      }
      thread::sleep(ALLOCATE_POLL_INTERVAL);
    }
  }

  /// Constructs a [`StreamWorker`] bound to `(cid, socket)` and registers it.
  /// Does not start the worker's read loop; call [`CidRegistry::start`] for that.
  pub fn create(self: &Arc<Self>, cid: u64, socket: TcpStream) -> io::Result<Arc<StreamWorker>> {
    let handle: Arc<dyn RegistryHandle> = Arc::clone(self) as Arc<dyn RegistryHandle>;
    let worker = StreamWorker::new(cid, socket, handle);
    let mut state = unwrap_poison(self.state.lock())?;
    state.streams.insert(cid, worker.clone());
    Ok(worker)
  }

  /// Begins the stream worker registered under `cid`, if present.
  pub fn start(&self, cid: u64) -> io::Result<()> {
    let worker = {
      let state = unwrap_poison(self.state.lock())?;
      state.streams.get(&cid).cloned()
    };
    if let Some(worker) = worker {
      worker.start();
    }
    Ok(())
  }

  /// Requests cooperative shutdown of the worker for `cid`. A no-op if `cid`
  /// is unknown (the worker may already have reaped itself).
  pub fn close(&self, cid: u64) -> io::Result<()> {
    let worker = {
      let state = unwrap_poison(self.state.lock())?;
      state.streams.get(&cid).cloned()
    };
    if let Some(worker) = worker {
      worker.close();
    }
    Ok(())
  }

  /// Unregisters `cid`. On the server role, marks the matching slot inactive
  /// and stamps its deactivation time so it can't be reissued before cooldown.
  pub fn remove_cid(&self, cid: u64) -> io::Result<()> {
    let mut state = unwrap_poison(self.state.lock())?;
    state.streams.remove(&cid);
    if self.is_server {
      if let Some(slot) = state.slots.get_mut(cid as usize) {
        slot.active = false;
        slot.last_deactivated = Some(Instant::now());
      }
    }
    Ok(())
  }

  /// Hands a CID received via a `Cid` frame to a blocked client-role `allocate()`.
  pub fn cid(&self, cid: u64) -> io::Result<()> {
    let mut state = unwrap_poison(self.state.lock())?;
    state.pending_cids.push_back(cid);
    Ok(())
  }

  /// Forwards `bytes` to the stream worker's local socket. Silently drops
  /// the payload if `cid` is unknown: the worker may have already reaped.
  pub fn send(&self, cid: u64, bytes: &[u8]) -> io::Result<()> {
    let worker = {
      let state = unwrap_poison(self.state.lock())?;
      state.streams.get(&cid).cloned()
    };
    if let Some(worker) = worker {
      // A dead local socket is discovered and cleaned up by the worker's own
      // read loop; there's nothing further to do with the error here.
      let _ = worker.send(bytes);
    }
    Ok(())
  }

  /// Pass-through to the control connection's serialized writer.
  pub fn write_frame(&self, frame: &Frame) -> io::Result<()> {
    self.control.write_frame(frame)
  }

  /// Closes every live stream and clears the map. The registry mutex is
  /// released before any worker's `close()` is called, since that join can block.
  pub fn closeall(&self) -> io::Result<()> {
    let workers: Vec<Arc<StreamWorker>> = {
      let mut state = unwrap_poison(self.state.lock())?;
      state.streams.drain().map(|(_, w)| w).collect()
    };
    for worker in workers {
      worker.close();
    }
    Ok(())
  }

  /// Number of live CID -> stream mappings, used by tests asserting the
  /// live-worker-count invariant.
  #[cfg(test)]
  pub fn live_count(&self) -> usize {
    unwrap_poison(self.state.lock()).unwrap().streams.len()
  }
}

impl RegistryHandle for CidRegistry {
  fn emit_data(&self, cid: u64, bytes: Vec<u8>) -> io::Result<()> {
    self.control.write_frame(&Frame::Data(cid, bytes))
  }

  fn emit_close(&self, cid: u64) -> io::Result<()> {
    self.control.write_frame(&Frame::Close(cid))
  }

  fn remove(&self, cid: u64) {
    let _ = CidRegistry::remove_cid(self, cid);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
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

  fn registry(is_server: bool) -> Arc<CidRegistry> {
    let control = Arc::new(ControlConnection::new(Box::new(NullStream)));
    CidRegistry::new(control, is_server)
  }

  #[test]
  fn server_allocates_sequential_cids_when_nothing_is_free() {
    let reg = registry(true);
    assert_eq!(reg.allocate().unwrap(), 0);
    assert_eq!(reg.allocate().unwrap(), 1);
    assert_eq!(reg.allocate().unwrap(), 2);
  }

  #[test]
  fn server_refuses_to_reuse_a_cid_before_cooldown_elapses() {
    let reg = registry(true);
    let cid = reg.allocate().unwrap();
    reg.remove_cid(cid).unwrap();
    // Cooldown has not elapsed: the next allocate must mint a new slot.
    assert_eq!(reg.allocate().unwrap(), cid + 1);
  }

  #[test]
  fn server_reuses_a_cid_once_cooldown_has_elapsed() {
    let reg = registry(true);
    let cid = reg.allocate().unwrap();
    reg.remove_cid(cid).unwrap();
    {
      let mut state = unwrap_poison(reg.state.lock()).unwrap();
      state.slots[cid as usize].last_deactivated = Instant::now().checked_sub(Duration::from_secs(61));
    }
    assert_eq!(reg.allocate().unwrap(), cid);
  }

  #[test]
  fn client_allocate_blocks_until_cid_is_delivered() {
    let reg = registry(false);
    let reg2 = reg.clone();
    let handle = thread::spawn(move || reg2.allocate().unwrap());
    thread::sleep(Duration::from_millis(50));
    reg.cid(7).unwrap();
    assert_eq!(handle.join().unwrap(), 7);
  }

  #[test]
  fn send_to_unknown_cid_is_a_silent_no_op() {
    let reg = registry(true);
    assert!(reg.send(999, b"data").is_ok());
  }

  #[test]
  fn close_of_unknown_cid_is_a_silent_no_op() {
    let reg = registry(true);
    assert!(reg.close(999).is_ok());
  }
}
