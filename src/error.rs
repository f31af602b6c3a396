//! Error taxonomy for the tunnel: network, protocol, policy and config failures.
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::io::ErrorKind;

/// Result alias used throughout the crate.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Protocol-level violations observed on the control connection.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
  /// The peer's program-text digest did not match ours.
  VersionMismatch,
  /// A frame carried a tag we don't recognize.
  UnknownTag(u64),
  /// The stream ended before a frame's declared payload was fully read.
  TruncatedFrame,
}

impl Display for ProtocolError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ProtocolError::VersionMismatch => f.write_str("peer version digest does not match ours"),
      ProtocolError::UnknownTag(tag) => write!(f, "unknown frame tag {tag}"),
      ProtocolError::TruncatedFrame => f.write_str("stream ended mid-frame"),
    }
  }
}
impl Error for ProtocolError {}

impl ProtocolError {
  /// Wraps this violation as an `io::Error` so it can propagate through the
  /// codec's generic `Read`-based functions, which speak `io::Result` rather
  /// than [`TunnelResult`]. `TruncatedFrame` keeps `UnexpectedEof` as its
  /// kind so callers that distinguish a clean disconnect still can.
  pub fn into_io_error(self) -> io::Error {
    let kind = match self {
      ProtocolError::TruncatedFrame => ErrorKind::UnexpectedEof,
      ProtocolError::VersionMismatch | ProtocolError::UnknownTag(_) => ErrorKind::InvalidData,
    };
    io::Error::new(kind, self.to_string())
  }
}

/// Policy violations: the peer asked for something the local config disallows.
#[derive(Debug)]
#[non_exhaustive]
pub enum PolicyError {
  /// A `Connect` named a port this side never advertised.
  PortNotForwarded(u64),
  /// A listener could not bind because something else already owns the port.
  BindCollision(u16),
}

impl Display for PolicyError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      PolicyError::PortNotForwarded(port) => write!(f, "port {port} is not in the forward set"),
      PolicyError::BindCollision(port) => write!(f, "port {port} is already bound"),
    }
  }
}
impl Error for PolicyError {}

/// Malformed CLI/config input, caught before any socket is touched.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
  /// A `--mapping a:b` entry didn't parse as two `u16`s separated by `:`.
  MalformedMapping(String),
  /// Two mapping entries (or an entry and a forward port) collide.
  DuplicatePort(u16),
  /// A mapping key was not present in `--forward`.
  MappingTargetsUnforwardedPort(u16),
  /// The server role was selected without a `--key` path.
  MissingServerKey,
}

impl Display for ConfigError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ConfigError::MalformedMapping(raw) => write!(f, "malformed --mapping entry: {raw:?}"),
      ConfigError::DuplicatePort(port) => write!(f, "port {port} is used more than once"),
      ConfigError::MappingTargetsUnforwardedPort(port) => {
        write!(f, "--mapping references port {port} which is not in --forward")
      }
      ConfigError::MissingServerKey => f.write_str("server role requires --key"),
    }
  }
}
impl Error for ConfigError {}

/// The crate's top level error type. Every other error kind converts into it via `?`.
#[derive(Debug)]
#[non_exhaustive]
pub enum TunnelError {
  /// Socket or TLS read/write/accept/connect failure.
  Network(io::Error),
  /// Control-connection framing violation.
  Protocol(ProtocolError),
  /// Peer request rejected by local policy.
  Policy(PolicyError),
  /// Bad CLI/config input.
  Config(ConfigError),
}

impl TunnelError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      TunnelError::Network(err) => err.kind(),
      TunnelError::Protocol(_) => ErrorKind::InvalidData,
      TunnelError::Policy(_) => ErrorKind::Other,
      TunnelError::Config(_) => ErrorKind::InvalidInput,
    }
  }
}

impl Display for TunnelError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      TunnelError::Network(err) => Display::fmt(err, f),
      TunnelError::Protocol(err) => Display::fmt(err, f),
      TunnelError::Policy(err) => Display::fmt(err, f),
      TunnelError::Config(err) => Display::fmt(err, f),
    }
  }
}
impl Error for TunnelError {}

impl From<io::Error> for TunnelError {
  fn from(value: io::Error) -> Self {
    TunnelError::Network(value)
  }
}

impl From<ProtocolError> for TunnelError {
  fn from(value: ProtocolError) -> Self {
    TunnelError::Protocol(value)
  }
}

impl From<PolicyError> for TunnelError {
  fn from(value: PolicyError) -> Self {
    TunnelError::Policy(value)
  }
}

impl From<ConfigError> for TunnelError {
  fn from(value: ConfigError) -> Self {
    TunnelError::Config(value)
  }
}

impl From<TunnelError> for io::Error {
  fn from(value: TunnelError) -> Self {
    match value {
      TunnelError::Network(err) => err,
      other => io::Error::new(other.kind(), other.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_error_converts_to_network_variant() {
    let err: TunnelError = io::Error::from(ErrorKind::BrokenPipe).into();
    assert!(matches!(err, TunnelError::Network(_)));
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);
  }

  #[test]
  fn protocol_error_displays() {
    let err = TunnelError::Protocol(ProtocolError::VersionMismatch);
    assert_eq!(err.to_string(), "peer version digest does not match ours");
  }
}
