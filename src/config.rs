//! Parsed, validated process configuration. Built once from argv in
//! `main.rs` and never mutated afterward.
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

/// Which side of the control connection this process plays.
#[derive(Debug, Clone)]
pub enum Role {
  /// Listens for a peer on `port`.
  Server {
    /// Local TCP port to accept the control connection on.
    port: u16,
  },
  /// Dials a peer at `host:port`.
  Client {
    /// Peer host to dial.
    host: String,
    /// Peer port to dial.
    port: u16,
  },
}

/// Fully validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// Server or client role, and its connection parameters.
  pub role: Role,
  /// Host locally-dialed outbound connections are made against.
  pub target: String,
  /// Ports this side advertises to its peer as forwardable.
  pub forward: Vec<u16>,
  /// Advertised port -> local bind port remap, defaults to identity.
  pub mapping: HashMap<u16, u16>,
  /// Seconds a dialer waits between reconnect attempts.
  pub reconnect: u64,
  /// Seconds between keep-alive frames.
  pub keepalive: u64,
  /// Path to the PEM certificate (chain).
  pub cert: String,
  /// Path to the PEM private key. Only meaningful for the server role.
  pub key: Option<String>,
}

impl Config {
  /// Builds and validates a `Config` from already-parsed parts. `mapping_raw`
  /// holds the unparsed `a:b` entries exactly as given on the CLI.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    role: Role,
    target: String,
    forward: Vec<u16>,
    mapping_raw: &[String],
    reconnect: u64,
    keepalive: u64,
    cert: String,
    key: Option<String>,
  ) -> Result<Config, ConfigError> {
    let mapping = parse_mapping(mapping_raw)?;
    validate_ports(&forward, &mapping)?;
    if matches!(role, Role::Server { .. }) && key.is_none() {
      return Err(ConfigError::MissingServerKey);
    }
    Ok(Config { role, target, forward, mapping, reconnect, keepalive, cert, key })
  }

  /// The local bind port for an advertised port: the mapped value if present,
  /// else the advertised port itself.
  pub fn bind_port(&self, advertised: u16) -> u16 {
    self.mapping.get(&advertised).copied().unwrap_or(advertised)
  }
}

fn parse_mapping(raw: &[String]) -> Result<HashMap<u16, u16>, ConfigError> {
  let mut mapping = HashMap::with_capacity(raw.len());
  for entry in raw {
    let (advertised, local) = entry
      .split_once(':')
      .ok_or_else(|| ConfigError::MalformedMapping(entry.clone()))?;
    let advertised: u16 =
      advertised.parse().map_err(|_| ConfigError::MalformedMapping(entry.clone()))?;
    let local: u16 = local.parse().map_err(|_| ConfigError::MalformedMapping(entry.clone()))?;
    mapping.insert(advertised, local);
  }
  Ok(mapping)
}

fn validate_ports(forward: &[u16], mapping: &HashMap<u16, u16>) -> Result<(), ConfigError> {
  let mut seen = HashSet::with_capacity(forward.len());
  for &port in forward {
    if !seen.insert(port) {
      return Err(ConfigError::DuplicatePort(port));
    }
  }

  let mut bound = HashSet::with_capacity(forward.len());
  for &port in forward {
    let local = mapping.get(&port).copied().unwrap_or(port);
    if !bound.insert(local) {
      return Err(ConfigError::DuplicatePort(local));
    }
  }

  for &advertised in mapping.keys() {
    if !seen.contains(&advertised) {
      return Err(ConfigError::MappingTargetsUnforwardedPort(advertised));
    }
  }

  Ok(())
}
