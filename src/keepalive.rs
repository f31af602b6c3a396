//! Periodic liveness ping on the control connection. Runs on a coarse 1 s
//! wake so cancellation stays responsive even with a long keep-alive period,
//! and treats a write failure as fatal: it stops itself and closes the
//! control connection so the supervisor observes EOF promptly.
use crate::control::ControlConnection;
use crate::error_log;
use crate::frame::Frame;
use crate::util::unwrap_poison;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Wake granularity the ticker polls its running flag at, independent of
/// the configured keep-alive period.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Emits a one-byte `KeepAlive` frame every `period` until stopped.
pub struct KeepAliveTicker {
  running: Arc<AtomicBool>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveTicker {
  /// Starts the ticker on its own thread.
  pub fn start(control: Arc<ControlConnection>, period: Duration) -> Arc<KeepAliveTicker> {
    let running = Arc::new(AtomicBool::new(true));
    let ticker = Arc::new(KeepAliveTicker { running: running.clone(), handle: Mutex::new(None) });
    match thread::Builder::new().name("cidtun-keepalive".to_string()).spawn(move || {
      Self::run(control, period, running);
    }) {
      Ok(thread_handle) => {
        if let Ok(mut guard) = ticker.handle.lock() {
          *guard = Some(thread_handle);
        }
      }
      Err(e) => error_log!("cidtun: failed to spawn keepalive ticker: {e}"),
    }
    ticker
  }

  fn run(control: Arc<ControlConnection>, period: Duration, running: Arc<AtomicBool>) {
    let mut last_tick = Instant::now();
    while running.load(Ordering::Relaxed) {
      thread::sleep(POLL_INTERVAL);
      if !running.load(Ordering::Relaxed) {
        break;
      }
      if last_tick.elapsed() < period {
        continue;
      }
      last_tick = Instant::now();
      if let Err(e) = control.write_frame(&Frame::KeepAlive) {
        error_log!("cidtun: keepalive write failed, tearing down control connection: {e}");
        running.store(false, Ordering::Relaxed);
        break;
      }
    }
    // Every exit path, cooperative or not, closes the connection: a
    // cooperative close() needs it closed as part of session teardown
    // ordering, and a write failure needs the supervisor to see EOF.
    control.close();
  }

  /// Clears the running flag and joins the ticker thread.
  pub fn close(&self) {
    self.running.store(false, Ordering::Relaxed);
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
  use crate::tls::ReadWrite;
  use std::io;
  use std::sync::atomic::AtomicUsize;

  struct CountingStream {
    writes: AtomicUsize,
    shutdowns: AtomicUsize,
  }

  impl ReadWrite for CountingStream {
    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
      Ok(0)
    }
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
      self.writes.fetch_add(1, Ordering::Relaxed);
      Ok(buf.len())
    }
    fn shutdown(&self) {
      self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }
  }

  #[test]
  fn close_stops_the_thread_and_closes_the_connection() {
    let stream = Arc::new(CountingStream { writes: AtomicUsize::new(0), shutdowns: AtomicUsize::new(0) });

    struct Proxy(Arc<CountingStream>);
    impl ReadWrite for Proxy {
      fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
      }
      fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
      }
      fn shutdown(&self) {
        self.0.shutdown()
      }
    }

    let control = Arc::new(ControlConnection::new(Box::new(Proxy(stream.clone()))));
    let ticker = KeepAliveTicker::start(control, Duration::from_millis(10));
    thread::sleep(Duration::from_millis(50));
    ticker.close();
    assert!(stream.writes.load(Ordering::Relaxed) >= 1);
    assert_eq!(stream.shutdowns.load(Ordering::Relaxed), 1);
  }
}
