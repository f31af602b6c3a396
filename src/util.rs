use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::LockResult;

fn do_abort() -> ! {
  unreachable!(
    "A condition that should be unreachable was reached. Please file a bug report on https://github.com/tiipotto/cidtun."
  );
}

pub fn unwrap_some<T>(some: Option<T>) -> T {
  if let Some(t) = some {
    return t;
  }

  do_abort();
}

pub fn unwrap_poison<T>(result: LockResult<T>) -> io::Result<T> {
  result.map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned mutex"))
}

/// Rewrites an unspecified (`0.0.0.0` / `::`) bind address to its loopback
/// equivalent. A listener bound to `("0.0.0.0", port)` can't be dialed back
/// at that address on most platforms, so a `close()` that wants to wake a
/// blocked `accept()` by connecting to itself needs this translation first.
pub fn unspecified_to_loopback(addr: SocketAddr) -> SocketAddr {
  if !addr.ip().is_unspecified() {
    return addr;
  }
  let loopback = match addr.ip() {
    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)),
  };
  SocketAddr::new(loopback, addr.port())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unwrap_poison_converts_err() {
    let mutex = std::sync::Mutex::new(1);
    assert!(unwrap_poison(mutex.lock()).is_ok());
  }

  #[test]
  fn unspecified_v4_rewrites_to_loopback() {
    let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
    assert_eq!(unspecified_to_loopback(addr), "127.0.0.1:9000".parse().unwrap());
  }

  #[test]
  fn already_specific_address_is_unchanged() {
    let addr: SocketAddr = "192.168.1.5:9000".parse().unwrap();
    assert_eq!(unspecified_to_loopback(addr), addr);
  }
}
