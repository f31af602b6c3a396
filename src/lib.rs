//! cidtun multiplexes many TCP byte-streams between two peers over a single
//! mutually-supervised, server-authenticated TLS connection.
//!
//! Either peer may advertise local listening ports whose accepted connections
//! are forwarded across the tunnel and dialed against a configurable target
//! host on the other side. The binary is symmetric: one side opens the
//! control connection (`server`), the other dials it (`client`), but once
//! established both sides may originate forwarded streams.

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod port_listener;
pub mod registry;
pub mod session;
pub mod stream_worker;
pub mod tls;
#[allow(missing_docs)]
pub mod util;
pub mod version;

pub use config::{Config, Role};
pub use error::{TunnelError, TunnelResult};
pub use session::Session;

#[cfg(feature = "log")]
#[macro_export]
/// Calls `log::trace!`.
macro_rules! trace_log {
    (target: $target:expr, $($arg:tt)+) => (log::log!(target: $target, log::Level::Trace, $($arg)+));
    ($($arg:tt)+) => (log::log!(log::Level::Trace, $($arg)+))
}

#[cfg(not(feature = "log"))]
#[macro_export]
/// Calls `log::trace!`.
macro_rules! trace_log {
  (target: $target:expr, $($arg:tt)+) => {
      let _ = &($($arg)+);
  };
  ($($arg:tt)+) => {
      let _ = &($($arg)+);
  }
}

#[cfg(feature = "log")]
#[macro_export]
/// Calls `log::debug!`.
macro_rules! debug_log {
    (target: $target:expr, $($arg:tt)+) => (log::log!(target: $target, log::Level::Debug, $($arg)+));
    ($($arg:tt)+) => (log::log!(log::Level::Debug, $($arg)+))
}

#[cfg(not(feature = "log"))]
#[macro_export]
/// Calls `log::debug!`.
macro_rules! debug_log {
  (target: $target:expr, $($arg:tt)+) => {
      let _ = &($($arg)+);
  };
  ($($arg:tt)+) => {
      let _ = &($($arg)+);
  }
}

#[cfg(feature = "log")]
#[macro_export]
/// Calls `log::info!`.
macro_rules! info_log {
    (target: $target:expr, $($arg:tt)+) => (log::log!(target: $target, log::Level::Info, $($arg)+));
    ($($arg:tt)+) => (log::log!(log::Level::Info, $($arg)+))
}

#[cfg(not(feature = "log"))]
#[macro_export]
/// Calls `log::info!`.
macro_rules! info_log {
  (target: $target:expr, $($arg:tt)+) => {
      let _ = &($($arg)+);
  };
  ($($arg:tt)+) => {
      let _ = &($($arg)+);
  }
}

#[cfg(feature = "log")]
#[macro_export]
/// Calls `log::warn!`.
macro_rules! warn_log {
    (target: $target:expr, $($arg:tt)+) => (log::log!(target: $target, log::Level::Warn, $($arg)+));
    ($($arg:tt)+) => (log::log!(log::Level::Warn, $($arg)+))
}

#[cfg(not(feature = "log"))]
#[macro_export]
/// Calls `log::warn!`.
macro_rules! warn_log {
  (target: $target:expr, $($arg:tt)+) => {
      let _ = &($($arg)+);
  };
  ($($arg:tt)+) => {
      let _ = &($($arg)+);
  }
}

#[cfg(feature = "log")]
#[macro_export]
/// Calls `log::error!`.
macro_rules! error_log {
    (target: $target:expr, $($arg:tt)+) => (log::log!(target: $target, log::Level::Error, $($arg)+));
    ($($arg:tt)+) => (log::log!(log::Level::Error, $($arg)+))
}

#[cfg(not(feature = "log"))]
#[macro_export]
/// Calls `log::error!`.
macro_rules! error_log {
  (target: $target:expr, $($arg:tt)+) => {
      let _ = &($($arg)+);
  };
  ($($arg:tt)+) => {
      let _ = &($($arg)+);
  }
}
